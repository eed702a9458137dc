// 機能モジュール構造
pub mod features;
pub mod shared;

use features::expenses::repository::ExpenseRepository;
use features::users::repository::UserRepository;
use features::users::session::SessionManager;
use log::info;
use shared::config::environment::{initialize_logging_system, load_environment_variables};
use shared::errors::AppResult;
use shared::storage::{build_record_store, KeyValueStore, RecordStore, SqliteKeyValueStore};
use std::sync::Arc;

/// アプリケーション状態
///
/// ストアとリポジトリはプロセス起動時に一度だけ構築し、参照で各所へ
/// 引き回す。モジュールレベルの可変グローバルは持たない。
pub struct AppContext {
    /// レコードストアアダプタ（モードは起動時に確定済み）
    pub store: Arc<dyn RecordStore>,
    /// 経費リポジトリ
    pub expenses: Arc<ExpenseRepository>,
    /// ユーザーリポジトリ
    pub users: Arc<UserRepository>,
    /// セッション管理
    pub session: SessionManager,
}

impl AppContext {
    /// 購読を解放してアプリケーションを終了可能な状態にする
    pub fn shutdown(&self) {
        self.expenses.shutdown();
        self.users.shutdown();
        info!("リポジトリの購読を解放しました");
    }
}

/// アプリケーションを初期化する
///
/// # 戻り値
/// 構築済みのアプリケーション状態、または失敗時はエラー
///
/// # 処理内容
/// 1. 環境変数の読み込みとログシステムの初期化
/// 2. ローカルストレージの開設
/// 3. ストアモードの決定（クラウド同期設定があればクラウド、なければローカル）
/// 4. リポジトリとセッションの構築
pub async fn initialize_app() -> AppResult<AppContext> {
    load_environment_variables();
    initialize_logging_system();

    info!("アプリケーション初期化を開始します...");

    let kv: Arc<dyn KeyValueStore> = Arc::new(SqliteKeyValueStore::open_default()?);
    let store = build_record_store(Arc::clone(&kv)).await?;

    initialize_with_store(store, kv).await
}

/// ストアとローカルストレージを注入してアプリケーションを初期化する
///
/// テストや組み込み用途で、モード決定やストレージの場所を呼び出し側が
/// 制御したい場合に使う。
pub async fn initialize_with_store(
    store: Arc<dyn RecordStore>,
    kv: Arc<dyn KeyValueStore>,
) -> AppResult<AppContext> {
    let expenses = ExpenseRepository::initialize(Arc::clone(&store)).await?;
    let users = UserRepository::initialize(Arc::clone(&store)).await?;
    let session = SessionManager::new(Arc::clone(&users), kv);

    info!("アプリケーション初期化が完了しました: mode={:?}", store.mode());

    Ok(AppContext {
        store,
        expenses,
        users,
        session,
    })
}
