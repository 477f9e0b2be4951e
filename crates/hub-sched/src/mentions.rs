use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use hub_core::run::RunParams;
use hub_core::OrchestratorError;
use hub_engine::engine::{CreateRunOutcome, CreateRunRequest, RunEngine};

const SEEN_CAP: usize = 256;

/// A mention of an agent on an external surface (social feed, chat room).
#[derive(Clone, Debug)]
pub struct Mention {
    /// Source-assigned identifier, used for duplicate suppression.
    pub id: String,
    pub author: String,
    pub agent_id: String,
    pub text: String,
}

#[async_trait]
pub trait MentionSource: Send + Sync {
    /// Mentions that arrived since the previous poll. Sources may re-deliver;
    /// the poller deduplicates by mention id.
    async fn poll_mentions(&self) -> Result<Vec<Mention>, OrchestratorError>;
}

/// Turns external mentions into runs. Each mention gets its own thread
/// owned by the mention's author.
pub struct MentionPoller {
    source: Arc<dyn MentionSource>,
    engine: Arc<RunEngine>,
    seen: Mutex<VecDeque<String>>,
}

impl MentionPoller {
    pub fn new(source: Arc<dyn MentionSource>, engine: Arc<RunEngine>) -> Self {
        Self {
            source,
            engine,
            seen: Mutex::new(VecDeque::new()),
        }
    }

    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<(), OrchestratorError> {
        let mentions = self.source.poll_mentions().await?;
        for mention in mentions {
            if self.already_seen(&mention.id) {
                continue;
            }
            let request = CreateRunRequest {
                caller_id: mention.author.clone(),
                thread_id: None,
                agent_id: Some(mention.agent_id.clone()),
                assistant_id: None,
                new_message: Some(mention.text.clone()),
                params: RunParams::default(),
            };
            match self.engine.create_run(request).await {
                Ok(CreateRunOutcome::Run(run)) => {
                    info!(mention_id = %mention.id, run_id = %run.id, "mention run created");
                    if let Err(e) = self.engine.execute(&run.id, &Default::default()).await {
                        warn!(run_id = %run.id, error = %e, "mention run execution failed");
                    }
                }
                Ok(CreateRunOutcome::Scheduled(_)) => {}
                Err(e) => {
                    warn!(mention_id = %mention.id, error = %e, "mention rejected");
                }
            }
        }
        Ok(())
    }

    fn already_seen(&self, id: &str) -> bool {
        let mut seen = self.seen.lock();
        if seen.iter().any(|s| s == id) {
            return true;
        }
        seen.push_back(id.to_string());
        while seen.len() > SEEN_CAP {
            seen.pop_front();
        }
        false
    }
}
