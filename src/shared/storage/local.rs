use crate::shared::errors::AppResult;
use crate::shared::storage::{
    ChangeHandler, JsonMap, KeyValueStore, RecordStore, StoreMode, Subscription, WriteAck,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// ローカルスナップショットキーの接頭辞
const SNAPSHOT_KEY_PREFIX: &str = "keihi.";

/// スナップショット保存の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// 全レコードをそのまま保存できた
    Saved,
    /// 容量不足等のため、画像フィールドを空にした縮退コピーを保存した
    ImagesStripped,
    /// 縮退リトライも失敗し、このスナップショットの永続化を断念した
    Dropped,
    /// クラウドモードのため保存対象外
    Skipped,
}

/// ローカルモードのレコードストア兼永続化フォールバック
///
/// 書き込み操作は即時反映扱い（`WriteAck::Applied`）を返すだけで、
/// インメモリコレクションの更新は呼び出し元のリポジトリが同期的に行う。
/// 永続化は`persist`によるコレクション全体のスナップショット保存で、
/// 保存失敗時は画像フィールドを空にして1回だけ再試行する。
pub struct LocalStore {
    kv: Arc<dyn KeyValueStore>,
}

impl LocalStore {
    /// キー・バリューストアを指定してローカルストアを作成する
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// コレクション名から永続化キーを作る
    fn snapshot_key(collection: &str) -> String {
        format!("{SNAPSHOT_KEY_PREFIX}{collection}")
    }

    /// 保存済みスナップショットを読み込む
    ///
    /// # 引数
    /// * `collection` - コレクション名
    ///
    /// # 戻り値
    /// レコードの配列。キーが存在しない、またはJSONが壊れている・配列で
    /// ない場合は空の配列（破損スナップショットで初期化を止めない）
    pub fn load_collection(&self, collection: &str) -> Vec<Value> {
        let key = Self::snapshot_key(collection);

        let raw = match self.kv.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                log::warn!("スナップショットの読み込みに失敗しました: key={key}, error={e}");
                return Vec::new();
            }
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(records)) => records,
            Ok(_) => {
                log::warn!("スナップショットが配列形式ではないため破棄します: key={key}");
                Vec::new()
            }
            Err(e) => {
                log::warn!("スナップショットの解析に失敗したため破棄します: key={key}, error={e}");
                Vec::new()
            }
        }
    }

    /// コレクション全体のスナップショットを保存する
    ///
    /// # 引数
    /// * `collection` - コレクション名
    /// * `records` - 保存するレコードの配列
    /// * `image_fields` - 縮退時に空文字列へ置き換える画像フィールド名
    ///
    /// # 戻り値
    /// 保存結果。永続化に失敗してもエラーは返さない（インメモリ状態は
    /// 正しいまま、永続性だけが縮退する）
    ///
    /// # 処理内容
    /// 1. そのまま保存を試みる
    /// 2. 失敗したら全レコードの画像フィールドを空にして再試行する
    ///    （画像がスナップショットサイズの大半を占めるため）
    /// 3. それでも失敗したらログに残して断念する
    pub fn save_collection(
        &self,
        collection: &str,
        records: &[Value],
        image_fields: &[&str],
    ) -> PersistOutcome {
        let key = Self::snapshot_key(collection);

        let serialized = match serde_json::to_string(records) {
            Ok(s) => s,
            Err(e) => {
                log::error!("スナップショットのシリアライズに失敗しました: key={key}, error={e}");
                return PersistOutcome::Dropped;
            }
        };

        let first_error = match self.kv.set(&key, &serialized) {
            Ok(()) => return PersistOutcome::Saved,
            Err(e) => e,
        };

        log::warn!(
            "スナップショットの保存に失敗しました。画像を除いて再試行します: key={key}, error={first_error}"
        );

        // 画像フィールドを空にした縮退コピーを作って再試行
        let stripped = strip_image_fields(records, image_fields);
        let stripped_serialized = match serde_json::to_string(&stripped) {
            Ok(s) => s,
            Err(e) => {
                log::error!("縮退スナップショットのシリアライズに失敗しました: {e}");
                return PersistOutcome::Dropped;
            }
        };

        match self.kv.set(&key, &stripped_serialized) {
            Ok(()) => {
                log::warn!("画像を除いたスナップショットを保存しました: key={key}");
                PersistOutcome::ImagesStripped
            }
            Err(e) => {
                log::error!(
                    "縮退スナップショットの保存にも失敗しました。このスナップショットの永続化を断念します: key={key}, error={e}"
                );
                PersistOutcome::Dropped
            }
        }
    }
}

/// 全レコードの画像フィールドを空文字列に置き換えたコピーを作る
fn strip_image_fields(records: &[Value], image_fields: &[&str]) -> Vec<Value> {
    records
        .iter()
        .map(|record| {
            let mut cloned = record.clone();
            if let Value::Object(fields) = &mut cloned {
                for image_field in image_fields {
                    if fields.contains_key(*image_field) {
                        fields.insert((*image_field).to_string(), Value::String(String::new()));
                    }
                }
            }
            cloned
        })
        .collect()
}

#[async_trait]
impl RecordStore for LocalStore {
    fn mode(&self) -> StoreMode {
        StoreMode::Local
    }

    async fn put(&self, _collection: &str, _id: &str, _record: Value) -> AppResult<WriteAck> {
        // ローカルモードの書き込みは即時反映扱い。コレクションの更新と
        // persistによる永続化はリポジトリが行う
        Ok(WriteAck::Applied)
    }

    async fn patch(&self, _collection: &str, _id: &str, _fields: JsonMap) -> AppResult<WriteAck> {
        Ok(WriteAck::Applied)
    }

    async fn delete(&self, _collection: &str, _id: &str) -> AppResult<WriteAck> {
        Ok(WriteAck::Applied)
    }

    async fn delete_where(
        &self,
        _collection: &str,
        _field: &str,
        _value: &Value,
    ) -> AppResult<WriteAck> {
        Ok(WriteAck::Applied)
    }

    async fn persist(
        &self,
        collection: &str,
        records: &[Value],
        image_fields: &[&str],
    ) -> AppResult<PersistOutcome> {
        Ok(self.save_collection(collection, records, image_fields))
    }

    async fn subscribe(&self, collection: &str, handler: ChangeHandler) -> AppResult<Subscription> {
        // ローカルモードの購読は初回ロード通知の1回だけ
        let records = self.load_collection(collection);
        log::debug!(
            "ローカルストレージから {collection} を読み込みました: {}件",
            records.len()
        );
        handler(records);

        Ok(Subscription::none())
    }
}
