//! Exit codes for the CLI

use kiln_core::KilnError;
use kiln_tasks::BuildAbort;

use crate::cli::commands::BuildFailed;

/// Success
#[allow(dead_code)]
pub const SUCCESS: i32 = 0;

/// General error
pub const ERROR: i32 = 1;

/// Configuration error
pub const CONFIG_ERROR: i32 = 2;

/// One or more units failed
pub const BUILD_FAILED: i32 = 3;

/// Build stopped by outputs that could not be restored or removed
pub const BUILD_ABORTED: i32 = 4;

/// User cancelled
pub const CANCELLED: i32 = 130;

/// Map a command error to the process exit code
pub fn for_error(error: &anyhow::Error) -> i32 {
    if error.downcast_ref::<BuildAbort>().is_some() {
        BUILD_ABORTED
    } else if error.downcast_ref::<BuildFailed>().is_some() {
        BUILD_FAILED
    } else if error.downcast_ref::<KilnError>().is_some() {
        CONFIG_ERROR
    } else if matches!(
        error.downcast_ref::<dialoguer::Error>(),
        Some(dialoguer::Error::IO(e)) if e.kind() == std::io::ErrorKind::Interrupted
    ) {
        CANCELLED
    } else {
        ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::ConfigError;

    #[test]
    fn test_exit_codes() {
        let config: anyhow::Error = KilnError::from(ConfigError::MissingField("units".into())).into();
        assert_eq!(for_error(&config), CONFIG_ERROR);

        let failed: anyhow::Error = BuildFailed { failed: 2 }.into();
        assert_eq!(for_error(&failed), BUILD_FAILED);

        assert_eq!(for_error(&anyhow::anyhow!("boom")), ERROR);
    }
}
