//! Command phase: bind a kernel path to a ready-to-run loader.
//!
//! Everything here is recoverable: a bad path, a malformed image or a
//! mistyped option returns a [`CommandError`] to the command interpreter,
//! and dropping the partially built [`InitiumLoader`] releases the handles
//! and lists it collected. Once [`InitiumLoader::load`] is called, errors
//! stop being recoverable.

use crate::env::{Environment, Value};
use crate::error::CommandError;
use crate::itags::ItagRegistry;
use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use initium_elf::{ElfError, ElfImage, ProgramHeader};
use initium_platform::{BootDevice, FileHandle, FileSystem, Platform, VideoMode};
use initium_protocol::itags::ItagImage;
use initium_protocol::tags::{VIDEO_LFB, VIDEO_VGA};
use log::info;

/// What to load: the kernel and either an explicit module list or a module
/// directory whose regular files are all loaded.
#[derive(Debug, Clone)]
pub enum ModuleSpec {
    None,
    List(Vec<String>),
    Dir(String),
}

/// A parsed boot request.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub path: String,
    pub modules: ModuleSpec,
    pub env: Environment,
}

/// An opened, not-yet-loaded module.
pub struct Module {
    pub name: String,
    pub handle: Box<dyn FileHandle>,
}

/// A kernel bound to a boot entry, ready for the load pipeline.
pub struct InitiumLoader {
    pub(crate) path: String,
    pub(crate) handle: Box<dyn FileHandle>,
    pub(crate) image: ElfImage,
    pub(crate) phdrs: Vec<ProgramHeader>,
    pub(crate) itags: ItagRegistry,
    pub(crate) image_tag: ItagImage,
    pub(crate) modules: Vec<Module>,
    pub(crate) env: Environment,
    pub(crate) video: Option<VideoMode>,
    pub(crate) root_device: Option<BootDevice>,
}

impl core::fmt::Debug for InitiumLoader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InitiumLoader")
            .field("path", &self.path)
            .field("image", &self.image)
            .field("phdrs", &self.phdrs)
            .field("itags", &self.itags)
            .field("image_tag", &self.image_tag)
            .field("env", &self.env)
            .field("video", &self.video)
            .field("root_device", &self.root_device)
            .finish_non_exhaustive()
    }
}

impl InitiumLoader {
    /// Open and vet the kernel, collect its image tags, resolve options,
    /// the root device, the video mode and the module list.
    pub fn prepare<P: Platform>(
        platform: &P,
        fs: &mut dyn FileSystem,
        request: LoadRequest,
    ) -> Result<Self, CommandError> {
        let path = request.path;
        let mut env = request.env;

        let mut handle = fs.open(&path).map_err(|source| CommandError::Open {
            path: path.clone(),
            source,
        })?;

        let image = match initium_elf::identify(handle.as_mut()) {
            Ok(image) => image,
            Err(ElfError::UnknownImage) => {
                return Err(CommandError::UnknownImage { path });
            }
            Err(source) => return Err(CommandError::Read { path, source }),
        };
        let phdrs = initium_elf::program_headers(handle.as_mut(), &image)
            .map_err(|source| CommandError::Read {
                path: path.clone(),
                source,
            })?;

        let itags = collect_itags(handle.as_mut(), &image, &phdrs, &path)?;

        let Some(image_tag) = itags.image().copied() else {
            return Err(CommandError::NotInitium { path });
        };
        let version = { image_tag.version };
        if version != initium_protocol::VERSION {
            return Err(CommandError::UnsupportedVersion { path, version });
        }

        add_options(&itags, &mut env)?;
        let root_device = resolve_root_device(platform, &env)?;
        let video = init_video(platform, &itags);
        let modules = open_modules(fs, &request.modules)?;

        info!("initium: bound kernel '{path}'");

        Ok(Self {
            path,
            handle,
            image,
            phdrs,
            itags,
            image_tag,
            modules,
            env,
            video,
            root_device,
        })
    }
}

/// Iterate the kernel's notes into a registry. Non-Initium notes are other
/// people's business and skipped.
fn collect_itags(
    handle: &mut dyn FileHandle,
    image: &ElfImage,
    phdrs: &[ProgramHeader],
    path: &str,
) -> Result<ItagRegistry, CommandError> {
    let mut registry = ItagRegistry::new();
    let mut failure: Option<CommandError> = None;

    initium_elf::iterate_notes(handle, image, phdrs, &mut |note| {
        if note.name != initium_protocol::NOTE_NAME {
            return true;
        }
        match registry.add_note(path, note.note_type, note.desc) {
            Ok(()) => true,
            Err(err) => {
                failure = Some(err);
                false
            }
        }
    })
    .map_err(|source| CommandError::Read {
        path: path.into(),
        source,
    })?;

    match failure {
        Some(err) => Err(err),
        None => Ok(registry),
    }
}

/// Seed the environment with option defaults. Values configured before the
/// kernel was selected are kept, but must carry the declared type.
fn add_options(itags: &ItagRegistry, env: &mut Environment) -> Result<(), CommandError> {
    for option in itags.options() {
        match env.lookup(&option.name) {
            Some(existing) => {
                if !existing.same_type(&option.default) {
                    return Err(CommandError::OptionTypeMismatch {
                        name: option.name.clone(),
                    });
                }
            }
            None => env.insert(option.name.clone(), option.default.clone()),
        }
    }
    Ok(())
}

/// Resolve the `root_device` option, if set. `uuid:` and `other:` prefixes
/// describe the device to the kernel without the loader knowing it; anything
/// else must name a device the platform can find.
fn resolve_root_device<P: Platform>(
    platform: &P,
    env: &Environment,
) -> Result<Option<BootDevice>, CommandError> {
    let Some(value) = env.lookup("root_device") else {
        return Ok(None);
    };
    let Value::String(spec) = value else {
        return Err(CommandError::RootDeviceNotString);
    };

    if let Some(rest) = spec.strip_prefix("other:") {
        return Ok(Some(BootDevice::Other(rest.into())));
    }
    if let Some(rest) = spec.strip_prefix("uuid:") {
        return Ok(Some(BootDevice::Filesystem { uuid: rest.into() }));
    }

    match platform.lookup_device(spec) {
        Some(device) => Ok(Some(device)),
        None => Err(CommandError::RootDeviceNotFound { name: spec.clone() }),
    }
}

/// Pick a video mode. A VIDEO image tag constrains the acceptable kinds and
/// suggests a geometry; without one, any mode the platform offers will do.
fn init_video<P: Platform>(platform: &P, itags: &ItagRegistry) -> Option<VideoMode> {
    match itags.video() {
        Some(video) => {
            let video = *video;
            let types = { video.types };
            if types == 0 {
                return None;
            }
            platform.find_video_mode(types, { video.width }, { video.height }, {
                video.bpp
            })
        }
        None => platform.find_video_mode(u32::from(VIDEO_VGA | VIDEO_LFB), 0, 0, 0),
    }
}

/// Open the requested modules. A list is opened in the given order with the
/// basename as each module's name; a directory contributes every regular
/// file it holds.
fn open_modules(
    fs: &mut dyn FileSystem,
    spec: &ModuleSpec,
) -> Result<Vec<Module>, CommandError> {
    let mut modules = Vec::new();
    match spec {
        ModuleSpec::None => {}
        ModuleSpec::List(paths) => {
            for path in paths {
                let handle = fs.open(path).map_err(|source| CommandError::ModuleOpen {
                    path: path.clone(),
                    source,
                })?;
                modules.push(Module {
                    name: basename(path).into(),
                    handle,
                });
            }
        }
        ModuleSpec::Dir(dir) => {
            let mut names: Vec<String> = Vec::new();
            fs.iterate(dir, &mut |entry| {
                if !entry.is_directory {
                    names.push(entry.name.clone());
                }
                true
            })
            .map_err(|source| CommandError::ModuleIterate {
                path: dir.clone(),
                source,
            })?;

            for name in names {
                let path = format!("{dir}/{name}");
                let handle = fs.open(&path).map_err(|source| CommandError::ModuleOpen {
                    path: path.clone(),
                    source,
                })?;
                modules.push(Module { name, handle });
            }
        }
    }
    Ok(modules)
}

/// Final path component.
fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
