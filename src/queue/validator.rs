use std::collections::HashSet;

use crate::{
    error::Result,
    message::{MessageStatus, QueuedMessage},
    store::Store,
};

/// Result of a queue validation pass.
///
/// `issues` make the queue invalid; `warnings` are reported but tolerated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueValidation {
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl QueueValidation {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Clone)]
pub struct QueueValidator {
    store: Store,
}

impl QueueValidator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Validates `messages`, given head first.
    pub async fn validate(&self, messages: &[QueuedMessage]) -> Result<QueueValidation> {
        let mut report = QueueValidation::default();

        Self::check_structure(messages, &mut report);
        Self::check_order(messages, &mut report);
        self.check_store(messages, &mut report).await?;

        if !report.is_valid() {
            tracing::warn!(issues = ?report.issues, "queue validation failed");
        }
        for warning in &report.warnings {
            tracing::warn!("{warning}");
        }

        Ok(report)
    }

    fn check_structure(messages: &[QueuedMessage], report: &mut QueueValidation) {
        let mut seen = HashSet::new();
        for message in messages {
            if let Err(e) = message.validate() {
                report.issues.push(e.to_string());
            }
            if !seen.insert(message.id.as_str()) {
                report
                    .issues
                    .push(format!("message {} is queued more than once", message.id));
            }
        }
    }

    // Ordering is maintained by the heap; a violation here means something
    // bypassed it, which is worth a warning but not a recovery pass.
    fn check_order(messages: &[QueuedMessage], report: &mut QueueValidation) {
        for (i, earlier) in messages.iter().enumerate() {
            for later in &messages[i + 1..] {
                if later.priority > earlier.priority {
                    report.warnings.push(format!(
                        "queue order violation: {} ({}) is behind {} ({})",
                        later.id, later.priority, earlier.id, earlier.priority
                    ));
                }
            }
        }
    }

    async fn check_store(
        &self,
        messages: &[QueuedMessage],
        report: &mut QueueValidation,
    ) -> Result<()> {
        for message in messages {
            match self.store.get_message(&message.id).await? {
                None => report
                    .issues
                    .push(format!("message {} is queued but not persisted", message.id)),
                Some(stored) if stored.status != MessageStatus::Pending => {
                    report.issues.push(format!(
                        "message {} is queued but persisted as {}",
                        message.id, stored.status
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}
