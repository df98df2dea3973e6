//! Client of the Las Cumbres Observatory request API.
//!
//! Each [`ObservationConfig`] becomes one request group with the `MANY`
//! operator: the time window is cut into consecutive windows of one cadence
//! each, and the scheduler may execute any number of them. Group names start
//! with `{target}_`, which is how pending requests are traced back to targets.
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::constants::HOURS_PER_DAY;
use crate::env_state::MopEnv;
use crate::mop_errors::MopError;
use crate::scheduler::{ObservationConfig, SchedulerApi, SubmissionOutcome};
use crate::time::{jd_to_iso, parse_iso_to_jd};
use crate::visibility::TimeWindow;

/// Upper bound on the number of windows in one request group.
const MAX_WINDOWS: usize = 100;

/// Connection settings of the LCO API.
#[derive(Debug, Clone)]
pub struct LcoScheduler {
    env: MopEnv,
    base_url: String,
    token: String,
    proposal: String,
}

#[derive(Debug, Deserialize)]
struct SubmittedGroup {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct GroupPage {
    #[serde(default)]
    results: Vec<Value>,
}

impl LcoScheduler {
    pub fn new(env: MopEnv, base_url: &str, token: &str, proposal: &str) -> Self {
        LcoScheduler {
            env,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            proposal: proposal.to_string(),
        }
    }

    fn request_groups_url(&self) -> String {
        format!("{}/requestgroups/", self.base_url)
    }
}

/// Cut `window` into consecutive windows of `cadence_hours`.
pub fn cadence_windows(window: &TimeWindow, cadence_hours: f64) -> Vec<TimeWindow> {
    let step = cadence_hours / HOURS_PER_DAY;
    if !(step > 0.0) || step >= window.duration() {
        return vec![*window];
    }
    let mut windows = Vec::new();
    let mut start = window.start;
    while start < window.end && windows.len() < MAX_WINDOWS {
        let end = (start + step).min(window.end);
        windows.push(TimeWindow { start, end });
        start = end;
    }
    windows
}

/// Request-group payload for one configuration.
pub fn build_request_group(config: &ObservationConfig, proposal: &str) -> Value {
    let requests: Vec<Value> = cadence_windows(&config.window, config.cadence_hours)
        .iter()
        .map(|w| {
            json!({
                "location": { "telescope_class": config.telescope_class },
                "configurations": [{
                    "type": "EXPOSE",
                    "instrument_type": config.instrument_type,
                    "target": {
                        "name": config.target,
                        "type": "ICRS",
                        "ra": config.ra,
                        "dec": config.dec,
                        "epoch": 2000,
                    },
                    "constraints": {
                        "max_airmass": config.max_airmass,
                        "min_lunar_distance": config.min_lunar_distance,
                    },
                    "acquisition_config": { "mode": "OFF" },
                    "guiding_config": { "mode": "ON", "optional": true },
                    "instrument_configs": [{
                        "exposure_time": config.exposure_time,
                        "exposure_count": config.exposure_count,
                        "optical_elements": { "filter": config.filter },
                    }],
                }],
                "windows": [{ "start": jd_to_iso(w.start), "end": jd_to_iso(w.end) }],
            })
        })
        .collect();

    json!({
        "name": config.group_name(),
        "proposal": proposal,
        "ipp_value": config.ipp,
        "operator": if requests.len() > 1 { "MANY" } else { "SINGLE" },
        "observation_type": "NORMAL",
        "requests": requests,
    })
}

/// Scheduled span of a request group: earliest window start to latest window end.
///
/// Groups without request windows fall back to top-level `start`/`end` fields.
pub fn scheduled_span(group: &Value) -> Option<TimeWindow> {
    let windows: Vec<&Value> = group["requests"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|r| r["windows"].as_array())
        .flatten()
        .collect();
    if windows.is_empty() {
        let start = parse_iso_to_jd(group["start"].as_str()?).ok()?;
        let end = parse_iso_to_jd(group["end"].as_str()?).ok()?;
        return TimeWindow::new(start, end).ok();
    }

    let mut start = f64::INFINITY;
    let mut end = f64::NEG_INFINITY;
    for window in windows {
        start = start.min(parse_iso_to_jd(window["start"].as_str()?).ok()?);
        end = end.max(parse_iso_to_jd(window["end"].as_str()?).ok()?);
    }
    TimeWindow::new(start, end).ok()
}

/// Rebuild the configuration of a pending request group.
///
/// Groups that do not follow the layout of [`build_request_group`] give `None`.
pub fn parse_request_group(group: &Value) -> Option<ObservationConfig> {
    let requests = group["requests"].as_array()?;
    let first = &requests.first()?["configurations"][0];
    let instrument = &first["instrument_configs"][0];
    let window = scheduled_span(group)?;
    // every window spans one cadence, except possibly the last one
    let cadence_hours = requests
        .first()
        .and_then(|r| {
            let s = parse_iso_to_jd(r["windows"][0]["start"].as_str()?).ok()?;
            let e = parse_iso_to_jd(r["windows"][0]["end"].as_str()?).ok()?;
            Some((e - s) * HOURS_PER_DAY)
        })
        .unwrap_or(window.duration() * HOURS_PER_DAY);

    Some(ObservationConfig {
        target: first["target"]["name"].as_str()?.to_string(),
        ra: first["target"]["ra"].as_f64()?,
        dec: first["target"]["dec"].as_f64()?,
        telescope_class: requests.first()?["location"]["telescope_class"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        instrument_type: first["instrument_type"].as_str()?.to_string(),
        filter: instrument["optical_elements"]["filter"].as_str()?.to_string(),
        exposure_time: instrument["exposure_time"].as_f64()?,
        exposure_count: instrument["exposure_count"].as_u64().unwrap_or(1) as u32,
        cadence_hours,
        window,
        ipp: group["ipp_value"].as_f64().unwrap_or(1.0),
        max_airmass: first["constraints"]["max_airmass"].as_f64().unwrap_or(2.0),
        min_lunar_distance: first["constraints"]["min_lunar_distance"].as_f64().unwrap_or(0.0),
    })
}

/// Outcome of one request-group submission.
///
/// Every failure is recorded against its own configuration so that the
/// requests accepted before it are still reported.
fn submission_outcome(response: Result<SubmittedGroup, MopError>) -> SubmissionOutcome {
    match response {
        Ok(group) => SubmissionOutcome::Accepted {
            id: group.id.to_string(),
        },
        Err(MopError::UreqHttpError(ureq::Error::StatusCode(code))) => SubmissionOutcome::Rejected {
            reason: format!("HTTP status {code}"),
        },
        Err(err) => SubmissionOutcome::Rejected {
            reason: err.to_string(),
        },
    }
}

impl SchedulerApi for LcoScheduler {
    fn submit(&self, configs: &[ObservationConfig]) -> Result<Vec<SubmissionOutcome>, MopError> {
        let url = self.request_groups_url();
        Ok(configs
            .iter()
            .map(|config| {
                let payload = build_request_group(config, &self.proposal);
                debug!(group = %config.group_name(), "submitting request group");
                submission_outcome(self.env.post_json::<_, _, SubmittedGroup>(
                    url.as_str(),
                    &self.token,
                    &payload,
                ))
            })
            .collect())
    }

    fn list_pending(&self, target: &str) -> Result<Vec<ObservationConfig>, MopError> {
        let page: GroupPage = self.env.get_json(
            self.request_groups_url().as_str(),
            &self.token,
            &[("state", "PENDING"), ("name", target), ("limit", "100")],
        )?;
        let prefix = format!("{target}_");

        Ok(page
            .results
            .iter()
            .filter(|g| g["name"].as_str().is_some_and(|n| n.starts_with(&prefix)))
            .filter_map(|g| {
                let parsed = parse_request_group(g);
                if parsed.is_none() {
                    warn!(group = %g["name"], "unreadable pending request group");
                }
                parsed
            })
            .collect())
    }
}
