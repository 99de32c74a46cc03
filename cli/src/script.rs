// Operation Scripts
//
// A JSON array of steps run in order against one bucket.

use std::time::{Duration, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strata_kernel::log::LogStore;
use strata_kernel::{Entry, KeyValueStore, KvError, Operation};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Put {
        key: String,
        value: String,
    },
    Create {
        key: String,
        value: String,
    },
    Update {
        key: String,
        value: String,
        revision: u64,
    },
    Get {
        key: String,
        #[serde(default)]
        revision: Option<u64>,
    },
    Delete {
        key: String,
        #[serde(default)]
        revision: Option<u64>,
    },
    Purge {
        key: String,
    },
    History {
        key: String,
    },
    Keys,
    Status,
    PurgeDeletes {
        #[serde(default)]
        threshold_ms: Option<u64>,
    },
    Sleep {
        ms: u64,
    },
}

/// JSON view of an entry.
#[derive(Debug, Serialize)]
pub struct EntryView {
    pub key: String,
    pub value: String,
    pub revision: u64,
    pub operation: Operation,
    pub created_ms: u64,
}

impl From<Entry> for EntryView {
    fn from(entry: Entry) -> Self {
        Self {
            created_ms: entry
                .created
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            key: entry.key,
            value: String::from_utf8_lossy(&entry.value).into_owned(),
            revision: entry.revision,
            operation: entry.operation,
        }
    }
}

/// Outcome of a single step.
#[derive(Debug, Serialize)]
pub struct StepOutcome {
    pub step: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn run_step<L: LogStore>(kv: &KeyValueStore<L>, step: &Step) -> Result<Value, KvError> {
    let value = match step {
        Step::Put { key, value } => {
            let revision = kv.put(key, value.as_bytes()).await?;
            json!({ "revision": revision })
        }
        Step::Create { key, value } => {
            let revision = kv.create(key, value.as_bytes()).await?;
            json!({ "revision": revision })
        }
        Step::Update {
            key,
            value,
            revision,
        } => {
            let revision = kv.update(key, value.as_bytes(), *revision).await?;
            json!({ "revision": revision })
        }
        Step::Get { key, revision } => {
            let entry = match revision {
                Some(revision) => kv.get_revision(key, *revision).await?,
                None => kv.get(key).await?,
            };
            json!(EntryView::from(entry))
        }
        Step::Delete { key, revision } => {
            let revision = kv.delete(key, *revision).await?;
            json!({ "revision": revision })
        }
        Step::Purge { key } => {
            let revision = kv.purge(key).await?;
            json!({ "revision": revision })
        }
        Step::History { key } => {
            let entries: Vec<EntryView> = kv
                .history(key)
                .await?
                .into_iter()
                .map(EntryView::from)
                .collect();
            json!(entries)
        }
        Step::Keys => json!(kv.keys().await?),
        Step::Status => json!(kv.status().await?),
        Step::PurgeDeletes { threshold_ms } => {
            let threshold = threshold_ms.map(Duration::from_millis);
            json!(kv.purge_deletes(threshold).await?)
        }
        Step::Sleep { ms } => {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            Value::Null
        }
    };
    Ok(value)
}

/// Run every step, recording failures instead of stopping at them.
pub async fn run_script<L: LogStore>(kv: &KeyValueStore<L>, steps: &[Step]) -> Vec<StepOutcome> {
    let mut outcomes = Vec::with_capacity(steps.len());

    for (i, step) in steps.iter().enumerate() {
        let outcome = match run_step(kv, step).await {
            Ok(result) => StepOutcome {
                step: i,
                result: Some(result),
                error: None,
            },
            Err(err) => {
                tracing::debug!(step = i, error = %err, "script step failed");
                StepOutcome {
                    step: i,
                    result: None,
                    error: Some(err.to_string()),
                }
            }
        };
        outcomes.push(outcome);
    }

    outcomes
}
