//! The image-tag registry.
//!
//! Notes named `"Initium"` from the kernel ELF are decoded into a typed
//! registry here. IMAGE, LOAD and VIDEO may appear at most once; OPTION and
//! MAPPING may repeat. A note may carry more bytes than the record needs
//! (trailing extensibility data is kept with the option payloads); it may
//! never carry fewer.

use crate::env::Value;
use crate::error::CommandError;
use alloc::string::String;
use alloc::vec::Vec;
use initium_protocol::itags::{
    ITAG_IMAGE, ITAG_LOAD, ITAG_MAPPING, ITAG_OPTION, ITAG_VIDEO, ItagImage, ItagLoad,
    ItagMapping, ItagOption, ItagVideo, OPTION_BOOLEAN, OPTION_INTEGER, OPTION_STRING,
    itag_may_repeat, min_itag_size,
};
use initium_protocol::read_record;

/// A decoded OPTION image tag.
#[derive(Debug, Clone)]
pub struct OptionTag {
    pub option_type: u8,
    pub name: String,
    pub description: String,
    pub default: Value,
}

/// One decoded image tag.
#[derive(Debug, Clone)]
pub enum ImageTag {
    Image(ItagImage),
    Load(ItagLoad),
    Video(ItagVideo),
    Option(OptionTag),
    Mapping(ItagMapping),
}

impl ImageTag {
    const fn tag_type(&self) -> u32 {
        match self {
            Self::Image(_) => ITAG_IMAGE,
            Self::Load(_) => ITAG_LOAD,
            Self::Video(_) => ITAG_VIDEO,
            Self::Option(_) => ITAG_OPTION,
            Self::Mapping(_) => ITAG_MAPPING,
        }
    }
}

/// All image tags of one kernel, in note order.
#[derive(Debug, Default)]
pub struct ItagRegistry {
    tags: Vec<ImageTag>,
}

impl ItagRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self { tags: Vec::new() }
    }

    /// Decode one Initium note into the registry, enforcing minimum sizes
    /// and uniqueness.
    pub fn add_note(&mut self, path: &str, note_type: u32, desc: &[u8]) -> Result<(), CommandError> {
        let Some(min_size) = min_itag_size(note_type) else {
            return Err(CommandError::UnrecognizedTag {
                path: path.into(),
                tag_type: note_type,
            });
        };
        if desc.len() < min_size {
            return Err(CommandError::UndersizedTag {
                path: path.into(),
                tag_type: note_type,
            });
        }
        if !itag_may_repeat(note_type) && self.tags.iter().any(|t| t.tag_type() == note_type) {
            return Err(CommandError::DuplicateTag {
                path: path.into(),
                tag_type: note_type,
            });
        }

        let tag = match note_type {
            ITAG_IMAGE => ImageTag::Image(read_record::<ItagImage>(desc).ok_or_else(|| {
                CommandError::UndersizedTag {
                    path: path.into(),
                    tag_type: note_type,
                }
            })?),
            ITAG_LOAD => ImageTag::Load(read_record::<ItagLoad>(desc).ok_or_else(|| {
                CommandError::UndersizedTag {
                    path: path.into(),
                    tag_type: note_type,
                }
            })?),
            ITAG_VIDEO => ImageTag::Video(read_record::<ItagVideo>(desc).ok_or_else(|| {
                CommandError::UndersizedTag {
                    path: path.into(),
                    tag_type: note_type,
                }
            })?),
            ITAG_MAPPING => ImageTag::Mapping(read_record::<ItagMapping>(desc).ok_or_else(
                || CommandError::UndersizedTag {
                    path: path.into(),
                    tag_type: note_type,
                },
            )?),
            ITAG_OPTION => ImageTag::Option(parse_option(path, desc)?),
            _ => unreachable!("filtered by min_itag_size"),
        };

        self.tags.push(tag);
        Ok(())
    }

    #[must_use]
    pub fn image(&self) -> Option<&ItagImage> {
        self.tags.iter().find_map(|t| match t {
            ImageTag::Image(i) => Some(i),
            _ => None,
        })
    }

    #[must_use]
    pub fn load(&self) -> Option<&ItagLoad> {
        self.tags.iter().find_map(|t| match t {
            ImageTag::Load(l) => Some(l),
            _ => None,
        })
    }

    #[must_use]
    pub fn video(&self) -> Option<&ItagVideo> {
        self.tags.iter().find_map(|t| match t {
            ImageTag::Video(v) => Some(v),
            _ => None,
        })
    }

    /// OPTION tags in note order.
    pub fn options(&self) -> impl Iterator<Item = &OptionTag> {
        self.tags.iter().filter_map(|t| match t {
            ImageTag::Option(o) => Some(o),
            _ => None,
        })
    }

    /// MAPPING tags in note order.
    pub fn mappings(&self) -> impl Iterator<Item = &ItagMapping> {
        self.tags.iter().filter_map(|t| match t {
            ImageTag::Mapping(m) => Some(m),
            _ => None,
        })
    }
}

/// Decode an OPTION note: fixed record, then name, description and default
/// value back to back.
fn parse_option(path: &str, desc: &[u8]) -> Result<OptionTag, CommandError> {
    let undersized = || CommandError::UndersizedTag {
        path: path.into(),
        tag_type: ITAG_OPTION,
    };

    let header = read_record::<ItagOption>(desc).ok_or_else(undersized)?;
    let name_size = usize::try_from(header.name_size).map_err(|_| undersized())?;
    let desc_size = usize::try_from(header.desc_size).map_err(|_| undersized())?;

    let name_start = size_of::<ItagOption>();
    let name_end = name_start.checked_add(name_size).ok_or_else(undersized)?;
    let desc_end = name_end.checked_add(desc_size).ok_or_else(undersized)?;
    if desc_end > desc.len() || name_size == 0 {
        return Err(undersized());
    }

    let name = cstr(&desc[name_start..name_end]).ok_or_else(undersized)?;
    let description = cstr(&desc[name_end..desc_end]).ok_or_else(undersized)?;
    let rest = &desc[desc_end..];

    let default = match header.option_type {
        OPTION_BOOLEAN => Value::Boolean(*rest.first().ok_or_else(undersized)? != 0),
        OPTION_STRING => Value::String(cstr(rest).ok_or_else(undersized)?),
        OPTION_INTEGER => {
            let bytes: [u8; 8] = rest
                .get(..8)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(undersized)?;
            Value::Integer(u64::from_le_bytes(bytes))
        }
        other => {
            return Err(CommandError::InvalidOptionType {
                path: path.into(),
                option_type: other,
                name,
            });
        }
    };

    Ok(OptionTag {
        option_type: header.option_type,
        name,
        description,
        default,
    })
}

/// Decode a NUL-terminated UTF-8 string from the front of `bytes`.
fn cstr(bytes: &[u8]) -> Option<String> {
    let raw = bytes.split(|&b| b == 0).next()?;
    core::str::from_utf8(raw).ok().map(String::from)
}
