use std::sync::Arc;

use metrics::counter;
use tracing::info;
use uuid::Uuid;

use dlq_common::eventbus::{DeadLetterQueueMessage, Publisher};

use crate::error::UsecaseError;
use crate::model::{DlqRecord, Meta};
use crate::store::MessageStore;

pub const DLQ_MESSAGES_STORED: &str = "dlq_messages_stored_total";
pub const DLQ_MESSAGES_REPUBLISHED: &str = "dlq_messages_republished_total";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub records: Vec<DlqRecord>,
    pub meta: Meta,
}

/// Storage, listing and republishing of dead letters.
pub struct DlqUsecase {
    store: Arc<dyn MessageStore>,
    publisher: Arc<dyn Publisher>,
}

impl DlqUsecase {
    pub fn new(store: Arc<dyn MessageStore>, publisher: Arc<dyn Publisher>) -> Self {
        Self { store, publisher }
    }

    pub async fn add(&self, message: DeadLetterQueueMessage) -> Result<DlqRecord, UsecaseError> {
        let record = DlqRecord::new(message);
        self.store.insert_one(&record).await?;

        counter!(DLQ_MESSAGES_STORED, "channel" => record.message.channel.clone()).increment(1);
        Ok(record)
    }

    pub async fn get_many(&self, page: i64, size: i64) -> Result<Page, UsecaseError> {
        if page < 1 || size < 1 {
            return Err(UsecaseError::InvalidPage);
        }
        let skip = (page - 1).saturating_mul(size);

        let (total, records) =
            tokio::try_join!(self.store.count(), self.store.find_many(size, skip))?;

        let meta = Meta {
            page,
            total_page: total / size + i64::from(total % size != 0),
            total_data_on_page: records.len() as i64,
            total_data: total,
        };
        Ok(Page { records, meta })
    }

    /// Send a stored dead letter back to its channel, then forget it.
    pub async fn republish(&self, id: &str) -> Result<DlqRecord, UsecaseError> {
        let not_found = || UsecaseError::NotFound(id.to_owned());
        let uuid = Uuid::parse_str(id).map_err(|_| not_found())?;
        let record = self.store.find_by_id(uuid).await?.ok_or_else(not_found)?;

        let message = &record.message;
        self.publisher
            .send(
                &message.channel,
                &message.key,
                &message.headers,
                message.message.as_bytes(),
            )
            .await?;
        self.store.delete_by_id(uuid).await?;

        info!(id, channel = %message.channel, key = %message.key, "dead letter republished");
        counter!(DLQ_MESSAGES_REPUBLISHED, "channel" => message.channel.clone()).increment(1);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use dlq_common::eventbus::{PublishError, ORIGIN_HEADER};
    use dlq_common::test_utils::RecordingPublisher;

    use crate::error::StoreError;
    use crate::store::{MemoryMessageStore, StoreResult};

    fn envelope(key: &str) -> DeadLetterQueueMessage {
        DeadLetterQueueMessage {
            channel: "orders".to_string(),
            publisher: "svc-a".to_string(),
            consumer: "svc-b".to_string(),
            key: key.to_string(),
            headers: [(ORIGIN_HEADER, "svc-a"), ("trace", "t-1")]
                .into_iter()
                .collect(),
            message: r#"{"id":"o1"}"#.to_string(),
            caused_by: "timeout".to_string(),
            failed_consume_date: "2024-01-01T00:00:00.000000000Z".to_string(),
        }
    }

    fn usecase() -> (DlqUsecase, Arc<MemoryMessageStore>, Arc<RecordingPublisher>) {
        let store = Arc::new(MemoryMessageStore::default());
        let publisher = Arc::new(RecordingPublisher::default());
        (
            DlqUsecase::new(store.clone(), publisher.clone()),
            store,
            publisher,
        )
    }

    #[tokio::test]
    async fn test_get_many_paginates() {
        let (usecase, _, _) = usecase();
        for i in 0..25 {
            usecase.add(envelope(&format!("k{i}"))).await.unwrap();
        }

        let page = usecase.get_many(2, 10).await.unwrap();
        assert_eq!(page.meta.page, 2);
        assert_eq!(page.meta.total_page, 3);
        assert_eq!(page.meta.total_data, 25);
        assert_eq!(page.meta.total_data_on_page, 10);
        assert_eq!(page.records.len(), 10);
        assert_eq!(page.records[0].message.key, "k10");

        let last = usecase.get_many(3, 10).await.unwrap();
        assert_eq!(last.records.len(), 5);
        assert_eq!(last.meta.total_data_on_page, 5);
    }

    #[tokio::test]
    async fn test_get_many_with_huge_page_size() {
        let (usecase, _, _) = usecase();
        usecase.add(envelope("k0")).await.unwrap();
        usecase.add(envelope("k1")).await.unwrap();

        let page = usecase.get_many(1, i64::MAX).await.unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.meta.total_page, 1);
        assert_eq!(page.meta.total_data, 2);

        let beyond = usecase.get_many(i64::MAX, i64::MAX).await.unwrap();
        assert!(beyond.records.is_empty());
        assert_eq!(beyond.meta.total_page, 1);
    }

    #[tokio::test]
    async fn test_get_many_empty_store() {
        let (usecase, _, _) = usecase();

        let page = usecase.get_many(1, 10).await.unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.meta.total_page, 0);
        assert_eq!(page.meta.total_data, 0);
    }

    #[tokio::test]
    async fn test_get_many_rejects_invalid_page() {
        let (usecase, _, _) = usecase();

        assert!(matches!(
            usecase.get_many(0, 10).await,
            Err(UsecaseError::InvalidPage)
        ));
        assert!(matches!(
            usecase.get_many(1, 0).await,
            Err(UsecaseError::InvalidPage)
        ));
    }

    #[tokio::test]
    async fn test_republish_missing_id() {
        let (usecase, _, publisher) = usecase();

        let unknown = Uuid::now_v7().to_string();
        for id in ["missing-id", unknown.as_str()] {
            let error = usecase.republish(id).await.unwrap_err();
            assert!(matches!(error, UsecaseError::NotFound(_)));
        }
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_republish_restores_original_message() {
        let (usecase, store, publisher) = usecase();
        let original = envelope("o1");
        let record = usecase.add(original.clone()).await.unwrap();

        let republished = usecase.republish(&record.id.to_string()).await.unwrap();
        assert_eq!(republished, record);

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "orders");
        assert_eq!(published[0].key, "o1");
        assert_eq!(published[0].headers, original.headers);
        assert_eq!(published[0].payload, original.message.as_bytes());

        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_republish_keeps_record() {
        let store = Arc::new(MemoryMessageStore::default());
        let usecase = DlqUsecase::new(store.clone(), Arc::new(RecordingPublisher::closed()));
        let record = usecase.add(envelope("o1")).await.unwrap();

        let error = usecase.republish(&record.id.to_string()).await.unwrap_err();
        assert!(matches!(error, UsecaseError::Publish(PublishError::Closed)));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    fn pool_closed() -> StoreError {
        StoreError::ConnectionError {
            error: sqlx::Error::PoolClosed,
        }
    }

    struct UnavailableStore;

    #[async_trait]
    impl MessageStore for UnavailableStore {
        async fn insert_one(&self, _: &DlqRecord) -> StoreResult<()> {
            Err(pool_closed())
        }

        async fn find_many(&self, _: i64, _: i64) -> StoreResult<Vec<DlqRecord>> {
            Ok(Vec::new())
        }

        async fn find_by_id(&self, _: Uuid) -> StoreResult<Option<DlqRecord>> {
            Err(pool_closed())
        }

        async fn count(&self) -> StoreResult<i64> {
            Err(pool_closed())
        }

        async fn delete_by_id(&self, _: Uuid) -> StoreResult<bool> {
            Err(pool_closed())
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_whole_page() {
        let usecase = DlqUsecase::new(
            Arc::new(UnavailableStore),
            Arc::new(RecordingPublisher::default()),
        );

        let error = usecase.get_many(1, 10).await.unwrap_err();
        assert!(matches!(error, UsecaseError::Store(_)));
        assert!(matches!(
            usecase.add(envelope("o1")).await,
            Err(UsecaseError::Store(_))
        ));
    }
}
