//! Resource limits.

use hutch_common::{HutchError, HutchResult};
use hutch_config::Rlimit;
use rustix::process::Resource;

/// Map an `RLIMIT_*` name to the kernel resource.
#[must_use]
pub fn parse_resource(name: &str) -> Option<Resource> {
    Some(match name {
        "RLIMIT_AS" => Resource::As,
        "RLIMIT_CORE" => Resource::Core,
        "RLIMIT_CPU" => Resource::Cpu,
        "RLIMIT_DATA" => Resource::Data,
        "RLIMIT_FSIZE" => Resource::Fsize,
        "RLIMIT_LOCKS" => Resource::Locks,
        "RLIMIT_MEMLOCK" => Resource::Memlock,
        "RLIMIT_MSGQUEUE" => Resource::Msgqueue,
        "RLIMIT_NICE" => Resource::Nice,
        "RLIMIT_NOFILE" => Resource::Nofile,
        "RLIMIT_NPROC" => Resource::Nproc,
        "RLIMIT_RSS" => Resource::Rss,
        "RLIMIT_RTPRIO" => Resource::Rtprio,
        "RLIMIT_RTTIME" => Resource::Rttime,
        "RLIMIT_SIGPENDING" => Resource::Sigpending,
        "RLIMIT_STACK" => Resource::Stack,
        _ => return None,
    })
}

/// `u64::MAX` means unlimited.
fn limit_value(value: u64) -> Option<u64> {
    (value != u64::MAX).then_some(value)
}

/// Apply resource limits to the current process.
///
/// # Errors
///
/// Returns an error for an unknown name or a limit the kernel refuses.
pub fn apply_rlimits(rlimits: &[Rlimit]) -> HutchResult<()> {
    for rlimit in rlimits {
        let resource = parse_resource(&rlimit.limit_type).ok_or_else(|| {
            HutchError::invalid_config(format!("unknown rlimit {}", rlimit.limit_type))
        })?;

        rustix::process::setrlimit(
            resource,
            rustix::process::Rlimit {
                current: limit_value(rlimit.soft),
                maximum: limit_value(rlimit.hard),
            },
        )
        .map_err(|e| HutchError::internal(format!("setrlimit {}: {e}", rlimit.limit_type)))?;

        tracing::debug!(
            limit = %rlimit.limit_type,
            soft = rlimit.soft,
            hard = rlimit.hard,
            "Set rlimit"
        );
    }
    Ok(())
}
