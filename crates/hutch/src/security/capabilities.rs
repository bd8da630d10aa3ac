//! Linux capabilities management.

use std::str::FromStr;

use caps::{CapSet, Capability, CapsHashSet};
use hutch_common::{HutchError, HutchResult};
use hutch_config::Capabilities;

/// Parse capability names (`CAP_NET_ADMIN`) into a set.
///
/// # Errors
///
/// Returns [`HutchError::InvalidConfig`] for a name this kernel interface
/// does not know.
pub fn parse_capabilities(names: &[String]) -> HutchResult<CapsHashSet> {
    names
        .iter()
        .map(|name| {
            Capability::from_str(name)
                .map_err(|_| HutchError::invalid_config(format!("unknown capability: {name}")))
        })
        .collect()
}

/// Drop every capability outside `bounding` from the bounding set.
///
/// Must run while the process still holds `CAP_SETPCAP`.
///
/// # Errors
///
/// Returns an error if a name is unknown or a drop is refused.
pub fn drop_bounding(capabilities: &Capabilities) -> HutchResult<()> {
    let keep = parse_capabilities(&capabilities.bounding)?;

    for cap in caps::all().difference(&keep) {
        // Capabilities newer than the running kernel are simply absent.
        if !caps::has_cap(None, CapSet::Bounding, *cap).unwrap_or(false) {
            continue;
        }
        caps::drop(None, CapSet::Bounding, *cap).map_err(|e| {
            HutchError::internal(format!("dropping {cap} from bounding set: {e}"))
        })?;
    }

    tracing::debug!(kept = keep.len(), "Restricted bounding set");
    Ok(())
}

/// Install the inheritable, effective, permitted and ambient sets.
///
/// Effective is narrowed before permitted so it never exceeds permitted.
///
/// # Errors
///
/// Returns an error if a name is unknown or the kernel refuses a set.
pub fn apply_capabilities(capabilities: &Capabilities) -> HutchResult<()> {
    for (set, names) in [
        (CapSet::Inheritable, &capabilities.inheritable),
        (CapSet::Effective, &capabilities.effective),
        (CapSet::Permitted, &capabilities.permitted),
    ] {
        let wanted = parse_capabilities(names)?;
        caps::set(None, set, &wanted)
            .map_err(|e| HutchError::internal(format!("setting {set:?} capabilities: {e}")))?;
    }

    // Ambient capabilities need kernel 4.3.
    let ambient = parse_capabilities(&capabilities.ambient)?;
    if let Err(e) = caps::set(None, CapSet::Ambient, &ambient) {
        if ambient.is_empty() {
            tracing::debug!(error = %e, "Ambient capabilities unsupported");
        } else {
            return Err(HutchError::internal(format!(
                "setting ambient capabilities: {e}"
            )));
        }
    }

    tracing::debug!(
        effective = capabilities.effective.len(),
        permitted = capabilities.permitted.len(),
        "Applied capability sets"
    );
    Ok(())
}
