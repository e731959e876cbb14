//! Sequential chain: every stage runs in order on the caller's task.

use async_trait::async_trait;

use crate::chain::Handler;
use crate::component::Component;
use crate::conn::Connection;
use crate::http::Request;
use crate::observability::metrics;

/// How a chain run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every stage returned true.
    Completed,
    /// The stage at this index returned false.
    Aborted { stage: usize },
}

/// An ordered list of stages run one after the other.
#[derive(Debug, Clone, Default)]
pub struct Chain {
    stages: Vec<Component>,
}

impl Chain {
    pub fn new(stages: Vec<Component>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Component] {
        &self.stages
    }

    /// Run the stages in order until one of them returns false.
    pub async fn run(&self, conn: &mut Connection, req: &Request) -> Outcome {
        for (index, stage) in self.stages.iter().enumerate() {
            if !stage.handle(conn, req).await {
                tracing::debug!(
                    connection_id = %conn.id(),
                    stage = stage.name(),
                    index,
                    "Chain aborted"
                );
                metrics::record_abort(stage.name());
                return Outcome::Aborted { stage: index };
            }
        }
        Outcome::Completed
    }
}

#[async_trait]
impl Handler for Chain {
    async fn serve(&self, mut conn: Connection, req: Request) -> Connection {
        self.run(&mut conn, &req).await;
        conn
    }
}
