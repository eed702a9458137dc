//! レコードストアアダプタ
//!
//! リポジトリ層から見た読み書きの窓口。バックエンドがリモートの
//! マルチクライアント・ドキュメントストア（クラウドモード）か、
//! 端末内のキー・バリューストレージ（ローカルモード）かを隠蔽する。
//! モードはプロセス起動時に一度だけ決定され、以後切り替わらない
//! （クラウドモードの購読エラーによる一方向のローカル降格を除く）。

pub mod cloud;
pub mod document_store;
pub mod kv;
pub mod local;

pub use cloud::CloudStore;
pub use document_store::{DocumentStore, MemoryDocumentStore, RemoteDocumentStore, WatchEvent};
pub use kv::{KeyValueStore, MemoryKeyValueStore, SqliteKeyValueStore, DEFAULT_QUOTA_BYTES};
pub use local::{LocalStore, PersistOutcome};

use crate::shared::config::environment::CloudSyncConfig;
use crate::shared::errors::{AppError, AppResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// JSONオブジェクトのフィールドマップ
pub type JsonMap = serde_json::Map<String, Value>;

/// コレクション変更の通知ハンドラ
///
/// コレクション全体のスナップショットを受け取る。配信順はバックエンドに
/// 依存するため、並び替えは受信側（リポジトリ）が行う。
pub type ChangeHandler = Box<dyn Fn(Vec<Value>) + Send + Sync>;

/// ストアの動作モード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// リモートのドキュメントストアを使用（書き込みは購読経由で反映）
    Cloud,
    /// 端末内ストレージを使用（書き込みは同期的に反映）
    Local,
}

/// 書き込みの可視性応答
///
/// モードごとの書き込み反映タイミングの違いを明示的な契約にする。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAck {
    /// 書き込みはバックエンドへ送信済み。インメモリコレクションへの反映は
    /// サーバー確認後の購読再配信によってのみ行われる（楽観的更新はしない）
    Pending,
    /// 書き込みは即時反映扱い。呼び出し元のリポジトリが自身のコレクションを
    /// 同期的に更新し、`persist`でスナップショットを永続化する
    Applied,
}

/// 購読ハンドル
///
/// リポジトリ破棄時に解放しないと、破棄済みコレクションへのコールバックが
/// リークする。ドロップ時に購読タスクを停止する。
pub struct Subscription {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    /// タスクを持たないハンドルを作成する（ローカルモードの初回通知用）
    pub(crate) fn none() -> Self {
        Self { task: None }
    }

    /// 購読タスクに紐づくハンドルを作成する
    pub(crate) fn with_task(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// 購読を明示的に解除する
    pub fn unsubscribe(self) {
        // Dropで停止する
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// レコードの読み書きと購読を提供する統一アダプタ
///
/// リポジトリはモードを意識せず、このトレイトの1つのAPIだけを呼ぶ。
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 現在の実効モードを取得する（降格後はLocalを返す）
    fn mode(&self) -> StoreMode;

    /// レコードをキー指定で保存する（同一キーへの再送は冪等）
    async fn put(&self, collection: &str, id: &str, record: Value) -> AppResult<WriteAck>;

    /// レコードの一部フィールドを更新する
    ///
    /// 対象レコードが存在しない場合は何もしない（エラーにしない）。
    async fn patch(&self, collection: &str, id: &str, fields: JsonMap) -> AppResult<WriteAck>;

    /// レコードを削除する（存在しない場合は何もしない）
    async fn delete(&self, collection: &str, id: &str) -> AppResult<WriteAck>;

    /// 指定フィールドが一致する全レコードを削除する
    ///
    /// クラウドモードでは単一のアトミックな一括削除として実行される。
    /// 途中でクラッシュしても部分的な削除状態は観測されない。
    async fn delete_where(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> AppResult<WriteAck>;

    /// コレクション全体のスナップショットを永続化する（ローカルモード用）
    ///
    /// クラウドモードでは何もしない。保存失敗時は画像フィールドを
    /// 空にして再試行し、それでも失敗した場合は永続性のみ縮退する
    /// （インメモリ状態は影響を受けず、エラーにもならない）。
    async fn persist(
        &self,
        collection: &str,
        records: &[Value],
        image_fields: &[&str],
    ) -> AppResult<PersistOutcome>;

    /// コレクションの変更を購読する
    ///
    /// クラウドモード: 初回スナップショットと以後の全変更がハンドラに届く。
    /// 自クライアントの書き込みも購読経由でのみ反映される。
    /// ローカルモード: 初回ロードの1回だけハンドラが呼ばれる。
    async fn subscribe(&self, collection: &str, handler: ChangeHandler) -> AppResult<Subscription>;
}

/// 起動時に一度だけストアのモードを決定して構築する
///
/// # 引数
/// * `kv` - ローカル永続化に使用するキー・バリューストア
///
/// # 戻り値
/// クラウド同期設定が構築できればクラウドモード、なければローカルモード
pub async fn build_record_store(kv: Arc<dyn KeyValueStore>) -> AppResult<Arc<dyn RecordStore>> {
    match CloudSyncConfig::from_env() {
        Some(config) => {
            config.validate().map_err(AppError::configuration)?;

            log::info!("クラウドモードで起動します: {}", config.base_url);
            let backend: Arc<dyn DocumentStore> = Arc::new(RemoteDocumentStore::new(config)?);
            Ok(Arc::new(CloudStore::new(backend, LocalStore::new(kv))))
        }
        None => {
            log::info!("クラウド同期設定が見つからないため、ローカルモードで起動します");
            Ok(Arc::new(LocalStore::new(kv)))
        }
    }
}

/// バックエンドを注入してクラウドモードのストアを構築する
///
/// テストや組み込み用途でリモートクライアント以外のバックエンドを使う。
pub fn build_cloud_store_with_backend(
    backend: Arc<dyn DocumentStore>,
    kv: Arc<dyn KeyValueStore>,
) -> Arc<dyn RecordStore> {
    Arc::new(CloudStore::new(backend, LocalStore::new(kv)))
}
