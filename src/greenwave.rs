// Bundle gating against Greenwave policy decisions

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::error::{IibError, Result};
use crate::registry::skopeo::get_image_labels;
use crate::settings::WorkerSettings;
use crate::state::WorkerState;

const NVR_LABELS: [&str; 3] = ["com.redhat.component", "version", "release"];

/// Policy query sent for each bundle when gating is requested
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreenwaveConfig {
    pub decision_context: String,
    pub product_version: String,
    pub subject_type: String,
}

/// External check that bundles passed their gating tests
#[async_trait]
pub trait GatingCheck: Send + Sync {
    /// Fails naming every bundle that does not satisfy the policy
    async fn gate_bundles(&self, state: &WorkerState, bundles: &[String], config: &GreenwaveConfig) -> Result<()>;
}

#[derive(Serialize)]
struct DecisionQuery<'a> {
    #[serde(flatten)]
    config: &'a GreenwaveConfig,
    subject_identifier: &'a str,
}

/// Greenwave `/decision` client; without `iib_greenwave_url` every gated request fails
pub struct GreenwaveClient {
    client: reqwest::Client,
    decision_url: Option<String>,
}

impl GreenwaveClient {
    pub fn new(settings: &WorkerSettings) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(settings.api_timeout()).build()?;
        Ok(Self {
            client,
            decision_url: settings
                .iib_greenwave_url
                .as_deref()
                .filter(|url| !url.is_empty())
                .map(|url| format!("{}/decision", url.trim_end_matches('/'))),
        })
    }

    /// Policy decision for one bundle: the unsatisfied test cases, empty when the policy is met
    async fn unsatisfied_testcases(
        &self,
        decision_url: &str,
        bundle: &str,
        nvr: &str,
        config: &GreenwaveConfig,
    ) -> Result<Option<Vec<String>>> {
        debug!(
            "Querying Greenwave with decision_context: {}, product_version: {}, subject_identifier: {} and subject_type: {}",
            config.decision_context, config.product_version, nvr, config.subject_type
        );
        let resp = self
            .client
            .post(decision_url)
            .json(&DecisionQuery {
                config,
                subject_identifier: nvr,
            })
            .send()
            .await
            .map_err(|e| IibError::iib(format!("Gating check failed for {}: {}", bundle, e)))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let data = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| {
            error!("Error encountered in decoding JSON {}", text);
            Value::Null
        });
        if !status.is_success() {
            let msg = data
                .get("message")
                .and_then(Value::as_str)
                .filter(|msg| !msg.is_empty())
                .map(str::to_string)
                .unwrap_or(text);
            error!("Request to Greenwave failed: {}", msg);
            return Err(IibError::iib(format!("Gating check failed for {}: {}", bundle, msg)));
        }

        match data.get("policies_satisfied").and_then(Value::as_bool) {
            Some(true) => Ok(None),
            Some(false) => {
                info!("Gating decision for {}: {}", bundle, data);
                let testcases = data
                    .get("unsatisfied_requirements")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|item| item.get("testcase").and_then(Value::as_str))
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Some(testcases))
            }
            None => {
                error!("Missing key \"policies_satisfied\" for {}: {}", bundle, data);
                Err(IibError::iib(format!(
                    "Key \"policies_satisfied\" missing in Greenwave response for {}",
                    bundle
                )))
            }
        }
    }
}

/// The Koji build NVR of a bundle, `{component}-{version}-{release}` from its labels
async fn koji_build_nvr(state: &WorkerState, bundle: &str) -> Result<String> {
    let labels = get_image_labels(state, bundle).await?;
    let parts = NVR_LABELS
        .iter()
        .map(|label| {
            labels.get(*label).cloned().ok_or_else(|| {
                IibError::iib(format!(
                    "The bundle {} does not have the label {} required for gating",
                    bundle, label
                ))
            })
        })
        .collect::<Result<Vec<String>>>()?;
    Ok(parts.join("-"))
}

#[async_trait]
impl GatingCheck for GreenwaveClient {
    async fn gate_bundles(&self, state: &WorkerState, bundles: &[String], config: &GreenwaveConfig) -> Result<()> {
        let Some(decision_url) = &self.decision_url else {
            error!("iib_greenwave_url is not set in the worker configuration");
            return Err(IibError::iib("IIB is not configured to handle gating of bundles"));
        };

        info!("Gating on bundles: {}", bundles.join(", "));
        let mut unsatisfied_bundles = Vec::new();
        let mut testcases = Vec::new();
        for bundle in bundles {
            let nvr = koji_build_nvr(state, bundle).await?;
            debug!("Querying Greenwave for decision on {}", nvr);
            if let Some(unsatisfied) = self
                .unsatisfied_testcases(decision_url, bundle, &nvr, config)
                .await?
            {
                unsatisfied_bundles.push(bundle.as_str());
                for testcase in unsatisfied {
                    if !testcases.contains(&testcase) {
                        testcases.push(testcase);
                    }
                }
            }
        }

        if unsatisfied_bundles.is_empty() {
            return Ok(());
        }
        Err(IibError::iib(format!(
            "Unsatisfied Greenwave policy for {} with decision_context: {}, product_version: {}, \
             subject_type: {} and test cases: {}",
            unsatisfied_bundles.join(", "),
            config.decision_context,
            config.product_version,
            config.subject_type,
            testcases.join(", ")
        )))
    }
}
