//! On-disk file-format version discovered at startup and the policy for
//! downgrading it at clean shutdown.

use crate::config::{FcvState, ReplicaState};

/// Compatibility floors tried in order at open; the first that succeeds
/// names the startup version.
pub const COMPAT_CURRENT: &str = "3.1.0";
pub const COMPAT_PREV1: &str = "3.0.0";
pub const COMPAT_PREV2: &str = "2.9.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupVersion {
    Current,
    /// Data files written under the previous release line (3.0).
    Release30,
    /// Data files written two release lines back (2.9).
    Release29,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileVersion {
    pub startup: StartupVersion,
}

impl FileVersion {
    /// Whether the data files should be reconfigured to the previous
    /// release's format before the final close.
    pub fn should_downgrade(
        &self,
        read_only: bool,
        replica: &ReplicaState,
        has_recovery_timestamp: bool,
    ) -> bool {
        if read_only {
            // A read-only engine cannot have upgraded, nor may it downgrade.
            return false;
        }
        if replica.arbiter {
            // Arbiters carry no compatibility document and must stay
            // readable by older binaries.
            return true;
        }
        match replica.fcv {
            FcvState::Unset => {
                // Without a compatibility document, trust what the data
                // files said at startup and downgrade back to it.
                self.startup == StartupVersion::Release30
                    || self.startup == StartupVersion::Release29
            }
            FcvState::Latest => false,
            FcvState::FullyDowngraded => {
                if replica.using_repl_sets {
                    // Startup replication recovery has already run.
                    return true;
                }
                // A standalone with a recovery timestamp still needs
                // replication recovery; downgrading now would strand it.
                !has_recovery_timestamp
            }
        }
    }

    /// The `compatibility=(release=X)` reconfiguration applied when
    /// downgrading.
    pub fn downgrade_config(&self, fcv: FcvState) -> &'static str {
        if fcv == FcvState::Unset {
            assert!(
                self.startup != StartupVersion::Current,
                "nothing to downgrade from the current format"
            );
            return match self.startup {
                StartupVersion::Release29 => "compatibility=(release=2.9)",
                _ => "compatibility=(release=3.0)",
            };
        }
        "compatibility=(release=3.0)"
    }
}
