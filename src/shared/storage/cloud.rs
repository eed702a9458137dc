use crate::shared::errors::AppResult;
use crate::shared::storage::{
    ChangeHandler, DocumentStore, JsonMap, LocalStore, PersistOutcome, RecordStore, StoreMode,
    Subscription, WatchEvent, WriteAck,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// クラウドモードのレコードストア
///
/// 書き込みはリモートのドキュメントストアへ送信し、インメモリへの反映は
/// サーバー確認後の購読再配信に委ねる（`WriteAck::Pending`）。これにより
/// 接続中の全クライアントが同一ストアに対して強い整合性を持つ代わりに、
/// 書き込みの可視化に1往復分の遅延がかかる。
///
/// 購読チャンネルが回復不能なエラーを起こした場合、セッションの残りは
/// ローカル動作へ降格する。降格は一方向で、クラウドへ復帰することはない。
pub struct CloudStore {
    backend: Arc<dyn DocumentStore>,
    fallback: LocalStore,
    demoted: Arc<AtomicBool>,
}

impl CloudStore {
    /// バックエンドと降格先のローカルストアを指定して作成する
    pub fn new(backend: Arc<dyn DocumentStore>, fallback: LocalStore) -> Self {
        Self {
            backend,
            fallback,
            demoted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// ローカル動作へ降格済みかどうか
    pub fn is_demoted(&self) -> bool {
        self.demoted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for CloudStore {
    fn mode(&self) -> StoreMode {
        if self.is_demoted() {
            StoreMode::Local
        } else {
            StoreMode::Cloud
        }
    }

    async fn put(&self, collection: &str, id: &str, record: Value) -> AppResult<WriteAck> {
        if self.is_demoted() {
            return Ok(WriteAck::Applied);
        }

        self.backend.put(collection, id, record).await?;
        Ok(WriteAck::Pending)
    }

    async fn patch(&self, collection: &str, id: &str, fields: JsonMap) -> AppResult<WriteAck> {
        if self.is_demoted() {
            return Ok(WriteAck::Applied);
        }

        self.backend.patch(collection, id, fields).await?;
        Ok(WriteAck::Pending)
    }

    async fn delete(&self, collection: &str, id: &str) -> AppResult<WriteAck> {
        if self.is_demoted() {
            return Ok(WriteAck::Applied);
        }

        self.backend.delete(collection, id).await?;
        Ok(WriteAck::Pending)
    }

    async fn delete_where(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> AppResult<WriteAck> {
        if self.is_demoted() {
            return Ok(WriteAck::Applied);
        }

        self.backend.delete_where(collection, field, value).await?;
        Ok(WriteAck::Pending)
    }

    async fn persist(
        &self,
        collection: &str,
        records: &[Value],
        image_fields: &[&str],
    ) -> AppResult<PersistOutcome> {
        if self.is_demoted() {
            // 降格後はローカルフォールバックへスナップショットを保存する
            return self.fallback.persist(collection, records, image_fields).await;
        }

        Ok(PersistOutcome::Skipped)
    }

    async fn subscribe(&self, collection: &str, handler: ChangeHandler) -> AppResult<Subscription> {
        if self.is_demoted() {
            return self.fallback.subscribe(collection, handler).await;
        }

        let receiver = match self.backend.watch(collection).await {
            Ok(receiver) => receiver,
            Err(e) => {
                // 監視を開始できない場合はこのセッションをローカル動作へ降格し、
                // ローカルスナップショットから初期データを配信する
                log::warn!(
                    "コレクション監視を開始できないため、ローカル動作へ降格します: collection={collection}, error={e}"
                );
                self.demoted.store(true, Ordering::SeqCst);
                return self.fallback.subscribe(collection, handler).await;
            }
        };

        let demoted = Arc::clone(&self.demoted);
        let collection_name = collection.to_string();

        let task = tokio::spawn(async move {
            let mut receiver = receiver;
            loop {
                match receiver.recv().await {
                    Some(WatchEvent::Snapshot(documents)) => {
                        handler(documents);
                    }
                    Some(WatchEvent::Error(message)) => {
                        log::warn!(
                            "購読チャンネルでエラーが発生したため、ローカル動作へ降格します: collection={collection_name}, error={message}"
                        );
                        demoted.store(true, Ordering::SeqCst);
                        return;
                    }
                    None => {
                        log::warn!(
                            "購読チャンネルが閉じられたため、ローカル動作へ降格します: collection={collection_name}"
                        );
                        demoted.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            }
        });

        Ok(Subscription::with_task(task))
    }
}
