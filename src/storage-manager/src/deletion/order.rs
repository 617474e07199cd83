use common::queue::Message;
use serde::{Deserialize, Serialize};

use crate::store::{CandidateRef, DeletionCandidate};

/// Queue carrying delete orders between scheduler and processor
pub const DELETE_ORDER_QUEUE: &str = "delete-orders";

/// Request to remove one claimed study or series from a storage group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOrder {
    pub candidate: CandidateRef,
    pub group_id: String,
    pub volume_id: i64,
    pub size_bytes: u64,
    #[serde(default)]
    pub external_retrieve_aet: Option<String>,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl DeleteOrder {
    pub fn from_candidate(candidate: &DeletionCandidate, group_id: impl Into<String>) -> Self {
        Self {
            candidate: candidate.reference(),
            group_id: group_id.into(),
            volume_id: candidate.volume_id,
            size_bytes: candidate.size_bytes,
            external_retrieve_aet: candidate.external_retrieve_aet.clone(),
            failure_count: 0,
            last_error: None,
        }
    }

    pub fn into_message(self) -> Message<DeleteOrder> {
        Message::new(DELETE_ORDER_QUEUE, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CandidateLevel;
    use chrono::Utc;

    #[test]
    fn test_order_from_candidate() {
        let candidate = DeletionCandidate {
            level: CandidateLevel::Study,
            pk: 4,
            iuid: "1.2.3".into(),
            study_iuid: "1.2.3".into(),
            volume_id: 2,
            size_bytes: 512,
            access_time: Utc::now(),
            external_retrieve_aet: Some("FAR".into()),
        };
        let order = DeleteOrder::from_candidate(&candidate, "ONLINE");
        assert_eq!(order.candidate.pk, 4);
        assert_eq!(order.volume_id, 2);
        assert_eq!(order.failure_count, 0);

        let envelope = order.clone().into_message().to_envelope().unwrap();
        assert_eq!(envelope.queue, DELETE_ORDER_QUEUE);
        assert_eq!(envelope.body["candidate"]["level"], "study");
        assert_eq!(
            Message::<DeleteOrder>::from_envelope(&envelope)
                .unwrap()
                .payload,
            order
        );
    }
}
