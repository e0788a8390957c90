//! Service readiness classification

use sm_core::rpc::ServiceStatus;

/// Classify service output by substring search.
///
/// Error patterns win over ready patterns; no match at all means the service
/// is still running.
pub fn classify_output(output: &str, ready_patterns: &[String], error_patterns: &[String]) -> ServiceStatus {
    let found = |patterns: &[String]| {
        patterns
            .iter()
            .any(|p| !p.is_empty() && output.contains(p.as_str()))
    };

    if found(error_patterns) {
        ServiceStatus::Error
    } else if found(ready_patterns) {
        ServiceStatus::Ready
    } else {
        ServiceStatus::Running
    }
}
