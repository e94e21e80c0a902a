use tracing::warn;

use crate::error::ValidationErrors;

/// Outcome of one check; `Err` carries the message reported to the caller.
pub(crate) type CheckResult = Result<(), String>;

pub(crate) type Check<T> = fn(&T) -> CheckResult;

/// Runs `gate` and then `checks` in order.
///
/// A failing gate always stops validation. Otherwise the first failure stops
/// the run unless `collect_errors` is set, in which case every check runs.
pub(crate) fn run_checks<T>(
    target: &T,
    gate: Check<T>,
    checks: &[Check<T>],
    collect_errors: bool,
) -> Result<(), ValidationErrors> {
    let mut errors = Vec::new();
    if let Err(error) = gate(target) {
        warn!(%error, "SAML message rejected");
        return Err(ValidationErrors(vec![error]));
    }
    for check in checks {
        if let Err(error) = check(target) {
            warn!(%error, "SAML message rejected");
            errors.push(error);
            if !collect_errors {
                break;
            }
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errors))
    }
}
