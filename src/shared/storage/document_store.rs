use crate::shared::config::environment::CloudSyncConfig;
use crate::shared::errors::{AppError, AppResult};
use crate::shared::storage::JsonMap;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// コレクション監視で配信されるイベント
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// コレクション全体の最新スナップショット
    Snapshot(Vec<Value>),
    /// 監視チャンネルの回復不能なエラー（以後イベントは届かない）
    Error(String),
}

/// 監視イベントの受信チャンネル
pub type WatchReceiver = mpsc::UnboundedReceiver<WatchEvent>;

/// リモートのドキュメント指向ストア
///
/// `(コレクション名, ドキュメントID)`でアドレスされ、キー指定の
/// put/patch/delete、条件一致の一括削除、コレクション単位の
/// リアルタイム監視を提供する。複数クライアントが同時に書き込む
/// 前提であり、レコード単位のlast-write-wins以外の順序保証はない。
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// ドキュメントをキー指定で保存する（存在すれば置き換え）
    async fn put(&self, collection: &str, id: &str, record: Value) -> AppResult<()>;

    /// ドキュメントの一部フィールドを更新する（存在しなければ何もしない）
    async fn patch(&self, collection: &str, id: &str, fields: JsonMap) -> AppResult<()>;

    /// ドキュメントを削除する（存在しなければ何もしない）
    async fn delete(&self, collection: &str, id: &str) -> AppResult<()>;

    /// 指定フィールドが一致する全ドキュメントをアトミックに削除する
    async fn delete_where(&self, collection: &str, field: &str, value: &Value) -> AppResult<()>;

    /// コレクションの監視を開始する
    ///
    /// 開始直後に現在のスナップショットが1回配信され、以後は書き込みの
    /// たびに（自クライアントの書き込みを含めて）最新スナップショットが
    /// 配信される。
    async fn watch(&self, collection: &str) -> AppResult<WatchReceiver>;
}

/// プロセス内のマルチクライアント・ドキュメントストア
///
/// 書き込みが成功するたびに、全ての監視者（書き込んだクライアント自身を
/// 含む）へコレクション全体のスナップショットを再配信する。テストと
/// 組み込みデモでクラウドモードの購読セマンティクスを実行可能にする。
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<String, Vec<Value>>>,
    watchers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<WatchEvent>>>>,
}

impl MemoryDocumentStore {
    /// 空のストアを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// 接続断をシミュレートする
    ///
    /// 全ての監視チャンネルへエラーを配信して閉じる。以後の書き込みは
    /// 成功するが、どの監視者にも届かない。
    pub fn disconnect(&self) {
        let mut watchers = match self.watchers.lock() {
            Ok(guard) => guard,
            Err(e) => {
                log::error!("監視チャンネルのロック取得に失敗しました: {e}");
                return;
            }
        };

        for senders in watchers.values() {
            for sender in senders {
                let _ = sender.send(WatchEvent::Error("接続が失われました".to_string()));
            }
        }
        watchers.clear();
    }

    /// 監視者へ最新スナップショットを配信する
    fn broadcast(&self, collection: &str, snapshot: Vec<Value>) {
        let mut watchers = match self.watchers.lock() {
            Ok(guard) => guard,
            Err(e) => {
                log::error!("監視チャンネルのロック取得に失敗しました: {e}");
                return;
            }
        };

        if let Some(senders) = watchers.get_mut(collection) {
            // 閉じられたチャンネルは配信時に取り除く
            senders.retain(|sender| sender.send(WatchEvent::Snapshot(snapshot.clone())).is_ok());
        }
    }

    fn lock_collections(&self) -> AppResult<std::sync::MutexGuard<'_, HashMap<String, Vec<Value>>>> {
        self.collections
            .lock()
            .map_err(|e| AppError::concurrency(format!("コレクションロック取得失敗: {e}")))
    }

    /// ドキュメントのidフィールドを取り出す
    fn doc_id(doc: &Value) -> Option<&str> {
        doc.get("id").and_then(Value::as_str)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(&self, collection: &str, id: &str, record: Value) -> AppResult<()> {
        let snapshot = {
            let mut collections = self.lock_collections()?;
            let docs = collections.entry(collection.to_string()).or_default();

            match docs.iter_mut().find(|d| Self::doc_id(d) == Some(id)) {
                Some(existing) => *existing = record,
                None => docs.push(record),
            }

            docs.clone()
        };

        self.broadcast(collection, snapshot);
        Ok(())
    }

    async fn patch(&self, collection: &str, id: &str, fields: JsonMap) -> AppResult<()> {
        let snapshot = {
            let mut collections = self.lock_collections()?;
            let docs = collections.entry(collection.to_string()).or_default();

            let Some(target) = docs.iter_mut().find(|d| Self::doc_id(d) == Some(id)) else {
                // 対象が存在しない場合は何もしない
                return Ok(());
            };

            if let Value::Object(existing) = target {
                for (key, value) in fields {
                    existing.insert(key, value);
                }
            }

            docs.clone()
        };

        self.broadcast(collection, snapshot);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> AppResult<()> {
        let snapshot = {
            let mut collections = self.lock_collections()?;
            let docs = collections.entry(collection.to_string()).or_default();

            let before = docs.len();
            docs.retain(|d| Self::doc_id(d) != Some(id));
            if docs.len() == before {
                return Ok(());
            }

            docs.clone()
        };

        self.broadcast(collection, snapshot);
        Ok(())
    }

    async fn delete_where(&self, collection: &str, field: &str, value: &Value) -> AppResult<()> {
        // 単一ロック内で全件を取り除くため、部分的な削除状態は観測されない
        let snapshot = {
            let mut collections = self.lock_collections()?;
            let docs = collections.entry(collection.to_string()).or_default();

            let before = docs.len();
            docs.retain(|d| d.get(field) != Some(value));
            if docs.len() == before {
                return Ok(());
            }

            docs.clone()
        };

        self.broadcast(collection, snapshot);
        Ok(())
    }

    async fn watch(&self, collection: &str) -> AppResult<WatchReceiver> {
        let (sender, receiver) = mpsc::unbounded_channel();

        // 開始直後に現在のスナップショットを配信する
        let initial = {
            let collections = self.lock_collections()?;
            collections.get(collection).cloned().unwrap_or_default()
        };
        let _ = sender.send(WatchEvent::Snapshot(initial));

        let mut watchers = self
            .watchers
            .lock()
            .map_err(|e| AppError::concurrency(format!("監視チャンネルロック取得失敗: {e}")))?;
        watchers
            .entry(collection.to_string())
            .or_default()
            .push(sender);

        Ok(receiver)
    }
}

/// リモートAPIサーバーをバックエンドとするドキュメントストア
///
/// `PUT/PATCH/DELETE /collections/{name}/documents/{id}` と
/// `POST /collections/{name}/batch-delete` を呼び出す。監視は
/// スナップショットエンドポイントのポーリングで実現し、変化が
/// あったときだけイベントを配信する。
pub struct RemoteDocumentStore {
    client: reqwest::Client,
    config: CloudSyncConfig,
}

impl RemoteDocumentStore {
    /// 設定を指定してリモートストアクライアントを作成する
    pub fn new(config: CloudSyncConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| AppError::configuration(format!("HTTPクライアント初期化失敗: {e}")))?;

        Ok(Self { client, config })
    }

    /// ドキュメントエンドポイントのURLを作る
    fn document_url(&self, collection: &str, id: &str) -> String {
        format!(
            "{}/collections/{collection}/documents/{id}",
            self.config.base_url
        )
    }

    /// 認証ヘッダーを付与する
    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {key}")),
            None => request,
        }
    }

    /// リトライ機能付きでリクエストを送信する
    ///
    /// ネットワークエラーは指数バックオフ（2^attempt秒）で最大リトライ回数
    /// まで再送する。404は「対象なしの無操作」として成功扱いにする。
    async fn send_request_with_retry(
        &self,
        request: reqwest::RequestBuilder,
        method: &str,
        endpoint: &str,
    ) -> AppResult<reqwest::Response> {
        let mut attempts = 0;
        loop {
            let Some(cloned_request) = request.try_clone() else {
                return Err(AppError::ExternalService(
                    "リクエストのクローンに失敗しました".to_string(),
                ));
            };

            match cloned_request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
                        if status == reqwest::StatusCode::NOT_FOUND {
                            log::debug!(
                                "{method}の対象が存在しないため何もしません: endpoint={endpoint}"
                            );
                        }
                        return Ok(response);
                    }

                    let body = response.text().await.unwrap_or_default();
                    return Err(AppError::ExternalService(format!(
                        "ドキュメントストアエラー: {method} {endpoint} -> {status}, body={body}"
                    )));
                }
                Err(e) => {
                    if attempts < self.config.max_retries {
                        attempts += 1;
                        let delay = Duration::from_secs(2_u64.pow(attempts));
                        log::warn!(
                            "リクエスト失敗、リトライします: {method} {endpoint}, attempt={attempts}/{}, delay={delay:?}",
                            self.config.max_retries
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(AppError::ExternalService(format!(
                        "ドキュメントストアへの接続に失敗しました: {e}"
                    )));
                }
            }
        }
    }

    /// コレクション全体を取得する
    async fn fetch_collection(&self, collection: &str) -> AppResult<Vec<Value>> {
        let url = format!("{}/collections/{collection}/documents", self.config.base_url);
        let request = self.with_auth(self.client.get(&url));

        let response = self
            .send_request_with_retry(request, "GET", &url)
            .await?;

        let documents: Vec<Value> = response
            .json()
            .await
            .map_err(|e| AppError::ExternalService(format!("レスポンス解析エラー: {e}")))?;

        Ok(documents)
    }
}

#[async_trait]
impl DocumentStore for RemoteDocumentStore {
    async fn put(&self, collection: &str, id: &str, record: Value) -> AppResult<()> {
        let url = self.document_url(collection, id);
        let request = self.with_auth(self.client.put(&url).json(&record));

        self.send_request_with_retry(request, "PUT", &url).await?;
        Ok(())
    }

    async fn patch(&self, collection: &str, id: &str, fields: JsonMap) -> AppResult<()> {
        let url = self.document_url(collection, id);
        let body = Value::Object(fields);
        let request = self.with_auth(self.client.patch(&url).json(&body));

        self.send_request_with_retry(request, "PATCH", &url).await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> AppResult<()> {
        let url = self.document_url(collection, id);
        let request = self.with_auth(self.client.delete(&url));

        self.send_request_with_retry(request, "DELETE", &url).await?;
        Ok(())
    }

    async fn delete_where(&self, collection: &str, field: &str, value: &Value) -> AppResult<()> {
        // サーバー側で単一のバッチ削除として実行される
        let url = format!(
            "{}/collections/{collection}/batch-delete",
            self.config.base_url
        );
        let body = serde_json::json!({ "field": field, "value": value });
        let request = self.with_auth(self.client.post(&url).json(&body));

        self.send_request_with_retry(request, "POST", &url).await?;
        Ok(())
    }

    async fn watch(&self, collection: &str) -> AppResult<WatchReceiver> {
        let (sender, receiver) = mpsc::unbounded_channel();

        let store = Self {
            client: self.client.clone(),
            config: self.config.clone(),
        };
        let collection = collection.to_string();
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let max_failures = self.config.max_retries;

        tokio::spawn(async move {
            let mut last_snapshot: Option<Vec<Value>> = None;
            let mut consecutive_failures = 0;

            loop {
                match store.fetch_collection(&collection).await {
                    Ok(documents) => {
                        consecutive_failures = 0;

                        // 変化があったときだけ配信する
                        if last_snapshot.as_ref() != Some(&documents) {
                            last_snapshot = Some(documents.clone());
                            if sender.send(WatchEvent::Snapshot(documents)).is_err() {
                                // 受信側が破棄された
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        log::warn!(
                            "コレクション監視の取得に失敗しました: collection={collection}, 連続失敗={consecutive_failures}, error={e}"
                        );

                        if consecutive_failures > max_failures {
                            let _ = sender.send(WatchEvent::Error(format!(
                                "コレクション監視を継続できません: {e}"
                            )));
                            return;
                        }
                    }
                }

                tokio::time::sleep(poll_interval).await;
            }
        });

        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_put_broadcasts_snapshot_to_all_watchers() {
        let store = Arc::new(MemoryDocumentStore::new());

        let mut watcher_a = store.watch("expenses").await.unwrap();
        let mut watcher_b = store.watch("expenses").await.unwrap();

        // 初回スナップショット（空）が届く
        assert!(matches!(
            watcher_a.recv().await,
            Some(WatchEvent::Snapshot(docs)) if docs.is_empty()
        ));
        assert!(matches!(
            watcher_b.recv().await,
            Some(WatchEvent::Snapshot(docs)) if docs.is_empty()
        ));

        store
            .put("expenses", "e1", json!({"id": "e1", "total": 1200.0}))
            .await
            .unwrap();

        // 書き込んだクライアントを含む全監視者に再配信される
        for watcher in [&mut watcher_a, &mut watcher_b] {
            match watcher.recv().await {
                Some(WatchEvent::Snapshot(docs)) => {
                    assert_eq!(docs.len(), 1);
                    assert_eq!(docs[0]["id"], json!("e1"));
                }
                other => panic!("スナップショットが届きませんでした: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_put_replaces_existing_document() {
        let store = MemoryDocumentStore::new();

        store
            .put("expenses", "e1", json!({"id": "e1", "total": 100.0}))
            .await
            .unwrap();
        store
            .put("expenses", "e1", json!({"id": "e1", "total": 200.0}))
            .await
            .unwrap();

        let mut watcher = store.watch("expenses").await.unwrap();
        match watcher.recv().await {
            Some(WatchEvent::Snapshot(docs)) => {
                assert_eq!(docs.len(), 1);
                assert_eq!(docs[0]["total"], json!(200.0));
            }
            other => panic!("スナップショットが届きませんでした: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_patch_merges_fields_and_ignores_missing() {
        let store = MemoryDocumentStore::new();

        store
            .put("expenses", "e1", json!({"id": "e1", "total": 100.0, "notes": "元のメモ"}))
            .await
            .unwrap();

        let mut fields = JsonMap::new();
        fields.insert("total".to_string(), json!(250.0));
        store.patch("expenses", "e1", fields).await.unwrap();

        // 存在しないIDへのpatchは無操作
        let mut missing = JsonMap::new();
        missing.insert("total".to_string(), json!(999.0));
        store.patch("expenses", "nope", missing).await.unwrap();

        let mut watcher = store.watch("expenses").await.unwrap();
        match watcher.recv().await {
            Some(WatchEvent::Snapshot(docs)) => {
                assert_eq!(docs.len(), 1);
                assert_eq!(docs[0]["total"], json!(250.0));
                assert_eq!(docs[0]["notes"], json!("元のメモ"));
            }
            other => panic!("スナップショットが届きませんでした: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delete_where_removes_all_matching_atomically() {
        let store = MemoryDocumentStore::new();

        store
            .put("expenses", "e1", json!({"id": "e1", "userId": "alice"}))
            .await
            .unwrap();
        store
            .put("expenses", "e2", json!({"id": "e2", "userId": "bob"}))
            .await
            .unwrap();
        store
            .put("expenses", "e3", json!({"id": "e3", "userId": "alice"}))
            .await
            .unwrap();

        store
            .delete_where("expenses", "userId", &json!("alice"))
            .await
            .unwrap();

        let mut watcher = store.watch("expenses").await.unwrap();
        match watcher.recv().await {
            Some(WatchEvent::Snapshot(docs)) => {
                assert_eq!(docs.len(), 1);
                assert_eq!(docs[0]["userId"], json!("bob"));
            }
            other => panic!("スナップショットが届きませんでした: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_sends_error_to_watchers() {
        let store = MemoryDocumentStore::new();

        let mut watcher = store.watch("expenses").await.unwrap();
        // 初回スナップショットを読み捨てる
        let _ = watcher.recv().await;

        store.disconnect();

        assert!(matches!(
            watcher.recv().await,
            Some(WatchEvent::Error(_))
        ));
    }
}
