//! Create the chainban chains and hook them into INPUT and OUTPUT.

use anyhow::{Context, Result};
use tracing::info;

use super::cache::ChainCache;
use super::{Iptables, Purpose};
use crate::cmd_abstraction::CommandExecutor;

/// Make sure every purpose/direction chain exists and is jumped to from its
/// parent. Idempotent: a second call issues no commands.
///
/// Returns the number of mutations issued.
pub fn ensure_topology<E: CommandExecutor>(
    iptables: &Iptables<E>,
    cache: &mut ChainCache,
) -> Result<usize> {
    let mut mutations = 0;

    for purpose in Purpose::ALL {
        for (name, direction) in purpose.chains() {
            cache.refresh(iptables)?;

            if !cache.chains().contains_key(&name) {
                info!("Creating chain {}", name);
                let result = iptables.run(&["-N", &name]);
                cache.invalidate();
                result.with_context(|| format!("Unable to create chain {}", name))?;
                mutations += 1;
                cache.refresh(iptables)?;
            }

            let linked = cache
                .chains()
                .get(direction.parent)
                .is_some_and(|parent| parent.links_to(&name));
            if !linked {
                info!("Linking {} into {}", name, direction.parent);
                let result = iptables.run(&["-I", direction.parent, "1", "-j", &name]);
                cache.invalidate();
                result.with_context(|| {
                    format!("Unable to link chain {} into {}", name, direction.parent)
                })?;
                mutations += 1;
            }
        }
    }

    Ok(mutations)
}
