use std::path::Path;

use serde::Serialize;
use steward_core::config::{ConfigError, EngineConfig};
use steward_providers::build_model;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(loaded: &Result<EngineConfig, ConfigError>, json_output: bool) -> String {
    let report = build_report(loaded);

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report(loaded: &Result<EngineConfig, ConfigError>) -> DoctorReport {
    let mut checks = Vec::new();

    match loaded {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_model_catalog(config));
            checks.push(check_trace_sink(config));
            checks.push(check_provider_reachability(config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["model_catalog", "trace_sink", "provider_reachability"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_model_catalog(config: &EngineConfig) -> DoctorCheck {
    if config.models.is_empty() {
        return DoctorCheck {
            name: "model_catalog",
            status: CheckStatus::Fail,
            details: "no models configured; every submission would fail routing".to_string(),
        };
    }
    let tiers: Vec<&str> = config.models.iter().map(|model| model.tier.as_key()).collect();
    DoctorCheck {
        name: "model_catalog",
        status: CheckStatus::Pass,
        details: format!("{} model(s) across tiers [{}]", config.models.len(), tiers.join(", ")),
    }
}

fn check_trace_sink(config: &EngineConfig) -> DoctorCheck {
    let Some(path) = &config.trace_path else {
        return DoctorCheck {
            name: "trace_sink",
            status: CheckStatus::Pass,
            details: "in-memory trace store (no trace_path configured)".to_string(),
        };
    };
    let parent = Path::new(path).parent().filter(|parent| !parent.as_os_str().is_empty());
    match parent {
        Some(parent) if !parent.exists() => DoctorCheck {
            name: "trace_sink",
            status: CheckStatus::Fail,
            details: format!("trace_path parent directory `{}` does not exist", parent.display()),
        },
        _ => DoctorCheck {
            name: "trace_sink",
            status: CheckStatus::Pass,
            details: format!("appending traces to `{path}`"),
        },
    }
}

fn check_provider_reachability(config: &EngineConfig) -> DoctorCheck {
    if config.models.is_empty() {
        return DoctorCheck {
            name: "provider_reachability",
            status: CheckStatus::Skipped,
            details: "skipped because no models are configured".to_string(),
        };
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "provider_reachability",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let mut unreachable = Vec::new();
    for model in &config.models {
        let adapter = match build_model(model) {
            Ok(adapter) => adapter,
            Err(error) => {
                unreachable.push(format!("{}: {error}", model.id));
                continue;
            }
        };
        let report = runtime.block_on(adapter.probe());
        if !report.reachable {
            unreachable.push(format!(
                "{}: {}",
                model.id,
                report.error.unwrap_or_else(|| "unreachable".to_string())
            ));
        }
    }

    if unreachable.is_empty() {
        DoctorCheck {
            name: "provider_reachability",
            status: CheckStatus::Pass,
            details: format!("all {} model(s) answered their probe", config.models.len()),
        }
    } else {
        DoctorCheck {
            name: "provider_reachability",
            status: CheckStatus::Fail,
            details: unreachable.join("; "),
        }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_catalog_fails_the_catalog_check() {
        let report = build_report(&Ok(EngineConfig::default()));
        assert_eq!(report.overall_status, CheckStatus::Fail);
        let catalog =
            report.checks.iter().find(|check| check.name == "model_catalog").unwrap();
        assert_eq!(catalog.status, CheckStatus::Fail);
    }

    #[test]
    fn config_failure_skips_downstream_checks() {
        let report =
            build_report(&Err(ConfigError::Invalid("duplicate model id `m`".to_string())));
        assert_eq!(report.checks[0].status, CheckStatus::Fail);
        assert!(report.checks[1..].iter().all(|check| check.status == CheckStatus::Skipped));
    }
}
