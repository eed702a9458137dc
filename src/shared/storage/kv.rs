use crate::shared::errors::{AppError, AppResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// ローカルストレージのデフォルト容量上限（バイト）
///
/// ブラウザのlocalStorageに合わせた控えめな上限。レシート画像が
/// data-URIでレコードに埋め込まれるため、容量超過は通常運用でも起こり得る。
pub const DEFAULT_QUOTA_BYTES: usize = 8 * 1024 * 1024;

/// 同期的なキー→文字列の永続ストア
///
/// 容量に上限があり、`set`は`AppError::QuotaExceeded`で失敗することがある。
/// 書き込み失敗時の縮退リトライはスナップショット層（`LocalStore`）が担う。
pub trait KeyValueStore: Send + Sync {
    /// キーに対応する値を取得する（存在しない場合はNone）
    fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// キーに値を保存する
    ///
    /// 保存後の合計サイズが容量上限を超える場合は`QuotaExceeded`を返す。
    fn set(&self, key: &str, value: &str) -> AppResult<()>;

    /// キーを削除する（存在しない場合は何もしない）
    fn remove(&self, key: &str) -> AppResult<()>;
}

/// SQLiteをバックエンドとするキー・バリューストア
///
/// 単一テーブル`kv_store`にキーと値を保持する。
pub struct SqliteKeyValueStore {
    /// データベース接続
    conn: Arc<Mutex<Connection>>,
    /// 容量上限（バイト）
    quota_bytes: usize,
}

impl SqliteKeyValueStore {
    /// デフォルトのデータディレクトリにストアを開く
    ///
    /// # 戻り値
    /// ストア、または失敗時はエラー
    ///
    /// # 処理内容
    /// 1. アプリケーションデータディレクトリの確保
    /// 2. 環境に応じたファイル名の決定
    /// 3. 接続開設とテーブル作成
    pub fn open_default() -> AppResult<Self> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| {
                AppError::configuration("アプリデータディレクトリの取得に失敗しました")
            })?
            .join("keihi-seisan");

        // ディレクトリが存在しない場合は作成
        if !data_dir.exists() {
            std::fs::create_dir_all(&data_dir).map_err(|e| {
                AppError::configuration(format!("アプリデータディレクトリの作成に失敗: {e}"))
            })?;
            log::info!("アプリケーションデータディレクトリを作成: {data_dir:?}");
        }

        let path = data_dir.join(Self::store_filename());
        Self::open_at(&path, DEFAULT_QUOTA_BYTES)
    }

    /// 指定したパスにストアを開く
    ///
    /// # 引数
    /// * `path` - データベースファイルのパス
    /// * `quota_bytes` - 容量上限（バイト）
    pub fn open_at(path: &Path, quota_bytes: usize) -> AppResult<Self> {
        let conn = Connection::open(path)?;
        Self::create_table(&conn)?;

        log::info!("ローカルストレージを初期化しました: {path:?}");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            quota_bytes,
        })
    }

    /// インメモリのストアを開く（テスト用）
    pub fn open_in_memory(quota_bytes: usize) -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::create_table(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            quota_bytes,
        })
    }

    /// 環境に応じたデータベースファイル名を取得する
    ///
    /// # ファイル名の規則
    /// - 開発環境: "dev_store.db"
    /// - プロダクション環境: "store.db"
    fn store_filename() -> &'static str {
        let is_production = if let Ok(env_var) = std::env::var("ENVIRONMENT") {
            env_var == "production"
        } else {
            !cfg!(debug_assertions)
        };

        if is_production {
            "store.db"
        } else {
            "dev_store.db"
        }
    }

    /// キー・バリューテーブルを作成する
    fn create_table(conn: &Connection) -> AppResult<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// ロックを取得する
    fn lock_conn(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| AppError::concurrency(format!("ストレージロック取得失敗: {e}")))
    }

    /// 書き込み後の合計サイズを見積もる
    ///
    /// 既存のキーを上書きする場合は旧値のサイズを差し引く。
    fn projected_total_bytes(
        conn: &Connection,
        key: &str,
        new_value_len: usize,
    ) -> AppResult<usize> {
        let current_total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(CAST(value AS BLOB)) + LENGTH(CAST(key AS BLOB))), 0) FROM kv_store",
            [],
            |row| row.get(0),
        )?;

        let existing_len: Option<i64> = conn
            .query_row(
                "SELECT LENGTH(CAST(value AS BLOB)) FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        let mut projected = current_total as usize + new_value_len + key.len();
        if let Some(old_len) = existing_len {
            // 上書きの場合、旧値とキーの分は二重に数えない
            projected = projected.saturating_sub(old_len as usize + key.len());
        }

        Ok(projected)
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.lock_conn()?;

        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let conn = self.lock_conn()?;

        // 容量上限チェック
        let projected = Self::projected_total_bytes(&conn, key, value.len())?;
        if projected > self.quota_bytes {
            return Err(AppError::quota_exceeded(format!(
                "書き込み後のサイズ {projected} バイトが上限 {} バイトを超えます",
                self.quota_bytes
            )));
        }

        conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;

        Ok(())
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }
}

/// インメモリのキー・バリューストア
///
/// テストで容量超過やスナップショット内容を直接検証するために使用する。
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
    quota_bytes: usize,
}

impl MemoryKeyValueStore {
    /// 容量上限を指定してストアを作成する
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota_bytes,
        }
    }

    /// 実質無制限のストアを作成する
    pub fn unbounded() -> Self {
        Self::with_quota(usize::MAX)
    }

    fn lock_entries(&self) -> AppResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|e| AppError::concurrency(format!("ストレージロック取得失敗: {e}")))
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        let entries = self.lock_entries()?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let mut entries = self.lock_entries()?;

        let current_total: usize = entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum();

        let projected = current_total + key.len() + value.len();
        if projected > self.quota_bytes {
            return Err(AppError::quota_exceeded(format!(
                "書き込み後のサイズ {projected} バイトが上限 {} バイトを超えます",
                self.quota_bytes
            )));
        }

        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        let mut entries = self.lock_entries()?;
        entries.remove(key);
        Ok(())
    }
}
