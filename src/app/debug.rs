//! Process-wide runtime tuning from `experimental.debug`.

use tracing::{debug, warn};

use crate::config::types::DebugOptions;

/// What [`apply_debug_options`] actually changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AppliedTuning {
    pub backtrace: bool,
    pub memory_limit: Option<u64>,
    pub max_open_files: Option<u64>,
}

/// Apply tuning once, while a box is being built. Failures are logged and
/// skipped: tuning never prevents a box from starting.
pub fn apply_debug_options(options: &DebugOptions) -> AppliedTuning {
    let mut applied = AppliedTuning::default();

    if options.backtrace {
        std::env::set_var("RUST_BACKTRACE", "1");
        applied.backtrace = true;
    }

    if let Some(limit) = options.memory_limit {
        match set_limit(Resource::AddressSpace, limit) {
            Ok(()) => applied.memory_limit = Some(limit),
            Err(e) => warn!(limit, error = %e, "failed to apply memory limit"),
        }
    }

    if let Some(limit) = options.max_open_files {
        match set_limit(Resource::OpenFiles, limit) {
            Ok(()) => applied.max_open_files = Some(limit),
            Err(e) => warn!(limit, error = %e, "failed to apply open file limit"),
        }
    }

    debug!(?applied, "debug options applied");
    applied
}

#[derive(Debug, Clone, Copy)]
enum Resource {
    AddressSpace,
    OpenFiles,
}

#[cfg(target_os = "linux")]
fn set_limit(resource: Resource, limit: u64) -> std::io::Result<()> {
    let resource = match resource {
        Resource::AddressSpace => libc::RLIMIT_AS,
        Resource::OpenFiles => libc::RLIMIT_NOFILE,
    };
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `current` is a valid, writable rlimit struct.
    if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let wanted = libc::rlimit {
        rlim_cur: (limit as libc::rlim_t).min(current.rlim_max),
        rlim_max: current.rlim_max,
    };
    // SAFETY: `wanted` is a valid rlimit struct that outlives the call.
    if unsafe { libc::setrlimit(resource, &wanted) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_limit(resource: Resource, _limit: u64) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("{:?} limit is only supported on linux", resource),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_options_change_nothing() {
        assert_eq!(apply_debug_options(&DebugOptions::default()), AppliedTuning::default());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn open_file_limit_is_clamped_to_hard_limit() {
        let mut original = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut original) }, 0);

        let applied = apply_debug_options(&DebugOptions {
            max_open_files: Some(4096),
            ..Default::default()
        });
        assert_eq!(applied.max_open_files, Some(4096));

        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut current) }, 0);
        assert!(current.rlim_cur <= 4096);
        assert!(current.rlim_cur <= current.rlim_max);

        // 恢复进程原有限制，避免影响同进程内的其他测试
        assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &original) }, 0);
    }
}
