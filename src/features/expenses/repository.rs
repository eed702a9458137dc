use crate::features::expenses::models::{Expense, ExpenseStatus, UpdateExpenseDto};
use crate::shared::errors::{AppError, AppResult};
use crate::shared::storage::{
    ChangeHandler, JsonMap, RecordStore, Subscription, WriteAck,
};
use crate::shared::utils::parse_rfc3339_or_epoch;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};

/// 経費コレクションの名前
pub const EXPENSES_COLLECTION: &str = "expenses";

/// スナップショット縮退時に空にする画像フィールド
const EXPENSE_IMAGE_FIELDS: &[&str] = &["receiptImage"];

/// 経費コレクションを新しい順（作成日時の降順）に並べ替える
///
/// バックエンドの配信順は作成順と一致する保証がないため、
/// 購読でスナップショットを受け取るたびに並べ直す。
fn sort_newest_first(expenses: &mut [Expense]) {
    expenses.sort_by(|a, b| {
        parse_rfc3339_or_epoch(&b.created_at).cmp(&parse_rfc3339_or_epoch(&a.created_at))
    });
}

/// 経費データのリポジトリ
///
/// インメモリの経費コレクションを排他的に所有する。コレクションは
/// 常に新しい順に並んでおり、一覧ビューはこの順序を前提にする。
///
/// クラウドモードでは書き込みの反映は購読再配信によってのみ行われ、
/// 呼び出しは即座に戻る（楽観的更新はしない）。ローカルモードでは
/// 書き込みは同期的に反映され、スナップショットが永続化される。
pub struct ExpenseRepository {
    /// レコードストアアダプタ
    store: Arc<dyn RecordStore>,
    /// インメモリの経費コレクション（新しい順）
    expenses: Arc<Mutex<Vec<Expense>>>,
    /// 購読ハンドル（破棄時に解放する）
    subscription: Mutex<Option<Subscription>>,
}

impl ExpenseRepository {
    /// リポジトリを構築してコレクションの購読を開始する
    ///
    /// # 引数
    /// * `store` - レコードストアアダプタ
    ///
    /// # 戻り値
    /// 初期化済みのリポジトリ、または失敗時はエラー
    ///
    /// # 処理内容
    /// クラウドモードでは初回スナップショットと以後の全変更が購読経由で
    /// コレクションに反映される。ローカルモードでは保存済みスナップショット
    /// が1回だけ配信される。どちらも受信時に新しい順へ並べ替える。
    pub async fn initialize(store: Arc<dyn RecordStore>) -> AppResult<Arc<Self>> {
        let repository = Arc::new(Self {
            store: Arc::clone(&store),
            expenses: Arc::new(Mutex::new(Vec::new())),
            subscription: Mutex::new(None),
        });

        let shared = Arc::clone(&repository.expenses);
        let handler: ChangeHandler = Box::new(move |documents| {
            let mut records: Vec<Expense> = documents
                .into_iter()
                .filter_map(|doc| match serde_json::from_value::<Expense>(doc) {
                    Ok(expense) => Some(expense),
                    Err(e) => {
                        log::warn!("解析できない経費レコードを無視します: {e}");
                        None
                    }
                })
                .collect();

            sort_newest_first(&mut records);

            match shared.lock() {
                Ok(mut collection) => *collection = records,
                Err(e) => log::error!("経費コレクションのロック取得に失敗しました: {e}"),
            }
        });

        let subscription = store.subscribe(EXPENSES_COLLECTION, handler).await?;
        *repository
            .subscription
            .lock()
            .map_err(|e| AppError::concurrency(format!("購読ハンドルのロック取得失敗: {e}")))? =
            Some(subscription);

        Ok(repository)
    }

    /// コレクションのロックを取得する
    fn lock_expenses(&self) -> AppResult<MutexGuard<'_, Vec<Expense>>> {
        self.expenses
            .lock()
            .map_err(|e| AppError::concurrency(format!("経費コレクションのロック取得失敗: {e}")))
    }

    /// 現在のコレクション全体をスナップショットとして永続化する
    ///
    /// ローカルモード専用のパス。保存に失敗しても永続性が縮退するだけで、
    /// インメモリ状態には影響しない。
    async fn persist_snapshot(&self) -> AppResult<()> {
        let documents: Vec<Value> = {
            let expenses = self.lock_expenses()?;
            expenses
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?
        };

        self.store
            .persist(EXPENSES_COLLECTION, &documents, EXPENSE_IMAGE_FIELDS)
            .await?;

        Ok(())
    }

    /// 経費を作成する
    ///
    /// # 引数
    /// * `expense` - 作成する経費（IDは呼び出し側で生成済み）
    ///
    /// # 処理内容
    /// クラウドモードではID指定のputを発行する（同一IDの再送が冪等になる）。
    /// ローカルモードではコレクションの先頭へ追加してスナップショットを
    /// 永続化する（一覧は新しい順が契約）。
    pub async fn create(&self, expense: Expense) -> AppResult<()> {
        expense.validate()?;

        let document = serde_json::to_value(&expense)?;
        let ack = self
            .store
            .put(EXPENSES_COLLECTION, &expense.id, document)
            .await
            .map_err(|e| {
                log::error!("経費の保存に失敗しました: id={}, error={e}", expense.id);
                e
            })?;

        if ack == WriteAck::Applied {
            {
                let mut expenses = self.lock_expenses()?;
                expenses.insert(0, expense);
            }
            self.persist_snapshot().await?;
        }

        Ok(())
    }

    /// 経費を部分更新する
    ///
    /// # 引数
    /// * `id` - 経費ID
    /// * `dto` - 更新するフィールド（指定されないフィールドは保持される）
    ///
    /// # 注意
    /// 対象IDが存在しない場合はエラーにせず何もしない。
    pub async fn edit(&self, id: &str, dto: UpdateExpenseDto) -> AppResult<()> {
        if dto.is_empty() {
            return Ok(());
        }

        let fields = dto.to_patch_map()?;
        let ack = self.store.patch(EXPENSES_COLLECTION, id, fields).await?;

        if ack == WriteAck::Applied {
            let changed = {
                let mut expenses = self.lock_expenses()?;
                match expenses.iter_mut().find(|e| e.id == id) {
                    Some(expense) => {
                        dto.apply_to(expense);
                        true
                    }
                    None => false,
                }
            };

            if changed {
                self.persist_snapshot().await?;
            }
        }

        Ok(())
    }

    /// 経費を1件削除する（存在しない場合は何もしない）
    pub async fn delete(&self, id: &str) -> AppResult<()> {
        let ack = self.store.delete(EXPENSES_COLLECTION, id).await?;

        if ack == WriteAck::Applied {
            let changed = {
                let mut expenses = self.lock_expenses()?;
                let before = expenses.len();
                expenses.retain(|e| e.id != id);
                expenses.len() != before
            };

            if changed {
                self.persist_snapshot().await?;
            }
        }

        Ok(())
    }

    /// 指定ユーザーが所有する全経費を削除する
    ///
    /// ユーザー削除時のカスケードとして呼ばれる。クラウドモードでは
    /// 単一のアトミックな一括削除として発行され、途中でクラッシュしても
    /// 部分的なカスケードは残らない。
    pub async fn delete_by_owner(&self, owner_id: &str) -> AppResult<()> {
        let ack = self
            .store
            .delete_where(
                EXPENSES_COLLECTION,
                "userId",
                &Value::String(owner_id.to_string()),
            )
            .await?;

        if ack == WriteAck::Applied {
            let changed = {
                let mut expenses = self.lock_expenses()?;
                let before = expenses.len();
                expenses.retain(|e| e.user_id != owner_id);
                expenses.len() != before
            };

            if changed {
                self.persist_snapshot().await?;
            }
        }

        Ok(())
    }

    /// 経費の承認ステータスを更新する
    ///
    /// # 引数
    /// * `id` - 経費ID
    /// * `status` - 新しいステータス
    /// * `notes` - 差し戻し理由など。空または未指定の場合は既存のメモを
    ///   保持する（消さない）
    pub async fn update_status(
        &self,
        id: &str,
        status: ExpenseStatus,
        notes: Option<&str>,
    ) -> AppResult<()> {
        let effective_notes = notes
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        let mut fields = JsonMap::new();
        fields.insert("status".to_string(), serde_json::to_value(status)?);
        if let Some(n) = &effective_notes {
            fields.insert("notes".to_string(), serde_json::to_value(n)?);
        }

        let ack = self.store.patch(EXPENSES_COLLECTION, id, fields).await?;

        if ack == WriteAck::Applied {
            let changed = {
                let mut expenses = self.lock_expenses()?;
                match expenses.iter_mut().find(|e| e.id == id) {
                    Some(expense) => {
                        expense.status = status;
                        if let Some(n) = &effective_notes {
                            expense.notes = n.clone();
                        }
                        true
                    }
                    None => false,
                }
            };

            if changed {
                self.persist_snapshot().await?;
            }
        }

        Ok(())
    }

    /// 指定ユーザーの経費一覧を取得する（新しい順）
    ///
    /// インメモリコレクションの純粋なフィルタで、I/Oは発生しない。
    pub fn list_by_owner(&self, owner_id: &str) -> Vec<Expense> {
        match self.lock_expenses() {
            Ok(expenses) => expenses
                .iter()
                .filter(|e| e.user_id == owner_id)
                .cloned()
                .collect(),
            Err(e) => {
                log::error!("経費一覧の取得に失敗しました: {e}");
                Vec::new()
            }
        }
    }

    /// 全経費の一覧を取得する（新しい順、承認者・管理者ビュー用）
    pub fn list_all(&self) -> Vec<Expense> {
        match self.lock_expenses() {
            Ok(expenses) => expenses.clone(),
            Err(e) => {
                log::error!("経費一覧の取得に失敗しました: {e}");
                Vec::new()
            }
        }
    }

    /// 購読を解放する
    ///
    /// リポジトリ破棄時に呼ぶことで、破棄済みコレクションへの
    /// コールバックが残らないようにする。
    pub fn shutdown(&self) {
        if let Ok(mut subscription) = self.subscription.lock() {
            if let Some(handle) = subscription.take() {
                handle.unsubscribe();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::expenses::models::ExpenseCategory;
    use crate::shared::storage::{
        build_cloud_store_with_backend, DocumentStore, KeyValueStore, LocalStore,
        MemoryDocumentStore, MemoryKeyValueStore,
    };
    use chrono::{Duration, TimeZone, Utc};
    use std::time::Duration as StdDuration;

    /// テスト用の経費を作成する
    fn make_expense(id: &str, owner_id: &str, created_at: &str) -> Expense {
        Expense {
            id: id.to_string(),
            user_id: owner_id.to_string(),
            user_name: "営業太郎".to_string(),
            merchant: "喫茶ひまわり".to_string(),
            date: "2024-06-01".to_string(),
            subtotal: 1000.0,
            tax: 100.0,
            total: 1100.0,
            category: ExpenseCategory::Restaurant,
            receipt_image: String::new(),
            status: ExpenseStatus::Submitted,
            notes: String::new(),
            created_at: created_at.to_string(),
        }
    }

    /// ローカルモードのリポジトリを作成する
    async fn make_local_repository(
        kv: Arc<MemoryKeyValueStore>,
    ) -> Arc<ExpenseRepository> {
        let store: Arc<dyn RecordStore> =
            Arc::new(LocalStore::new(Arc::clone(&kv) as Arc<dyn KeyValueStore>));
        ExpenseRepository::initialize(store).await.unwrap()
    }

    /// クラウドモードのリポジトリを作成する
    async fn make_cloud_repository(
        backend: Arc<MemoryDocumentStore>,
    ) -> Arc<ExpenseRepository> {
        let kv = Arc::new(MemoryKeyValueStore::unbounded());
        let store = build_cloud_store_with_backend(
            Arc::clone(&backend) as Arc<dyn DocumentStore>,
            kv as Arc<dyn KeyValueStore>,
        );
        ExpenseRepository::initialize(store).await.unwrap()
    }

    /// 条件が成立するまで待つ（テスト用）
    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("条件が時間内に成立しませんでした");
    }

    #[tokio::test]
    async fn test_local_create_lists_newest_first() {
        let kv = Arc::new(MemoryKeyValueStore::unbounded());
        let repository = make_local_repository(kv).await;

        // T1 < T2 の順で作成する
        repository
            .create(make_expense("e1", "u1", "2024-06-01T10:00:00+09:00"))
            .await
            .unwrap();
        repository
            .create(make_expense("e2", "u1", "2024-06-01T11:00:00+09:00"))
            .await
            .unwrap();

        let listed = repository.list_by_owner("u1");
        let ids: Vec<&str> = listed.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e2", "e1"]);
    }

    #[tokio::test]
    async fn test_list_by_owner_filters_other_owners() {
        let kv = Arc::new(MemoryKeyValueStore::unbounded());
        let repository = make_local_repository(kv).await;

        repository
            .create(make_expense("e1", "alice", "2024-06-01T10:00:00+09:00"))
            .await
            .unwrap();
        repository
            .create(make_expense("e2", "bob", "2024-06-01T11:00:00+09:00"))
            .await
            .unwrap();

        let alice_expenses = repository.list_by_owner("alice");
        assert_eq!(alice_expenses.len(), 1);
        assert_eq!(alice_expenses[0].id, "e1");
    }

    #[tokio::test]
    async fn test_local_edit_changes_only_specified_field() {
        let kv = Arc::new(MemoryKeyValueStore::unbounded());
        let repository = make_local_repository(kv).await;

        repository
            .create(make_expense("e1", "u1", "2024-06-01T10:00:00+09:00"))
            .await
            .unwrap();

        let dto = UpdateExpenseDto {
            total: Some(50.0),
            ..Default::default()
        };
        repository.edit("e1", dto).await.unwrap();

        // 指定したフィールド以外は元のまま
        let mut expected = make_expense("e1", "u1", "2024-06-01T10:00:00+09:00");
        expected.total = 50.0;
        assert_eq!(repository.list_by_owner("u1"), vec![expected]);
    }

    #[tokio::test]
    async fn test_edit_unknown_id_is_silent_noop() {
        let kv = Arc::new(MemoryKeyValueStore::unbounded());
        let repository = make_local_repository(kv).await;

        repository
            .create(make_expense("e1", "u1", "2024-06-01T10:00:00+09:00"))
            .await
            .unwrap();

        let dto = UpdateExpenseDto {
            total: Some(999.0),
            ..Default::default()
        };

        // 存在しないIDへの編集はエラーにならず、何も変わらない
        repository.edit("missing", dto).await.unwrap();
        assert_eq!(repository.list_by_owner("u1")[0].total, 1100.0);
    }

    #[tokio::test]
    async fn test_local_delete_and_missing_delete() {
        let kv = Arc::new(MemoryKeyValueStore::unbounded());
        let repository = make_local_repository(kv).await;

        repository
            .create(make_expense("e1", "u1", "2024-06-01T10:00:00+09:00"))
            .await
            .unwrap();

        repository.delete("e1").await.unwrap();
        assert!(repository.list_by_owner("u1").is_empty());

        // 存在しないIDの削除も無操作で成功する
        repository.delete("e1").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_delete_by_owner_leaves_others_untouched() {
        let kv = Arc::new(MemoryKeyValueStore::unbounded());
        let repository = make_local_repository(kv).await;

        repository
            .create(make_expense("e1", "alice", "2024-06-01T10:00:00+09:00"))
            .await
            .unwrap();
        repository
            .create(make_expense("e2", "bob", "2024-06-01T11:00:00+09:00"))
            .await
            .unwrap();
        repository
            .create(make_expense("e3", "alice", "2024-06-01T12:00:00+09:00"))
            .await
            .unwrap();

        repository.delete_by_owner("alice").await.unwrap();

        assert!(repository.list_by_owner("alice").is_empty());
        let remaining = repository.list_all();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "e2");
    }

    #[tokio::test]
    async fn test_update_status_preserves_notes_when_absent() {
        let kv = Arc::new(MemoryKeyValueStore::unbounded());
        let repository = make_local_repository(kv).await;

        let mut expense = make_expense("e1", "u1", "2024-06-01T10:00:00+09:00");
        expense.notes = "交際費として申請".to_string();
        repository.create(expense).await.unwrap();

        // メモなしの承認は既存メモを保持する
        repository
            .update_status("e1", ExpenseStatus::Approved, None)
            .await
            .unwrap();
        let approved = &repository.list_by_owner("u1")[0];
        assert_eq!(approved.status, ExpenseStatus::Approved);
        assert_eq!(approved.notes, "交際費として申請");

        // 空文字列のメモも「未指定」として扱う
        repository
            .update_status("e1", ExpenseStatus::Approved, Some("  "))
            .await
            .unwrap();
        assert_eq!(repository.list_by_owner("u1")[0].notes, "交際費として申請");

        // 差し戻し理由を指定した場合はメモを上書きする
        repository
            .update_status("e1", ExpenseStatus::Rejected, Some("レシートがありません"))
            .await
            .unwrap();
        let rejected = &repository.list_by_owner("u1")[0];
        assert_eq!(rejected.status, ExpenseStatus::Rejected);
        assert_eq!(rejected.notes, "レシートがありません");
    }

    #[tokio::test]
    async fn test_local_snapshot_survives_restart() {
        let kv = Arc::new(MemoryKeyValueStore::unbounded());

        {
            let repository = make_local_repository(Arc::clone(&kv)).await;
            repository
                .create(make_expense("e1", "u1", "2024-06-01T10:00:00+09:00"))
                .await
                .unwrap();
            repository
                .create(make_expense("e2", "u1", "2024-06-01T11:00:00+09:00"))
                .await
                .unwrap();
            repository.shutdown();
        }

        // 再起動相当: 同じストレージから新しいリポジトリを初期化する
        let restarted = make_local_repository(kv).await;
        let ids: Vec<String> = restarted
            .list_by_owner("u1")
            .iter()
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(ids, vec!["e2", "e1"]);
    }

    #[tokio::test]
    async fn test_malformed_snapshot_falls_back_to_empty() {
        let kv = Arc::new(MemoryKeyValueStore::unbounded());
        kv.set("keihi.expenses", "壊れたデータ{{{").unwrap();

        // 破損スナップショットでも初期化は成功し、空のコレクションになる
        let repository = make_local_repository(kv).await;
        assert!(repository.list_all().is_empty());
    }

    #[tokio::test]
    async fn test_quota_failure_strips_persisted_images_only() {
        // 画像入りのスナップショットが収まらない容量
        let kv = Arc::new(MemoryKeyValueStore::with_quota(1200));
        let repository = make_local_repository(Arc::clone(&kv)).await;

        let mut expense = make_expense("e1", "u1", "2024-06-01T10:00:00+09:00");
        expense.receipt_image = format!("data:image/jpeg;base64,{}", "A".repeat(2000));

        // 保存の縮退はエラーにならない
        repository.create(expense.clone()).await.unwrap();

        // インメモリのレコードは画像を保持したまま
        assert_eq!(
            repository.list_by_owner("u1")[0].receipt_image,
            expense.receipt_image
        );

        // 永続化されたコピーは画像が空になっている
        let saved = kv.get("keihi.expenses").unwrap().unwrap();
        let parsed: Vec<Value> = serde_json::from_str(&saved).unwrap();
        assert_eq!(parsed[0]["receiptImage"], serde_json::json!(""));
    }

    #[tokio::test]
    async fn test_cloud_create_visible_only_after_roundtrip() {
        let backend = Arc::new(MemoryDocumentStore::new());
        let repository = make_cloud_repository(Arc::clone(&backend)).await;

        repository
            .create(make_expense("e1", "u1", "2024-06-01T10:00:00+09:00"))
            .await
            .unwrap();

        // 書き込み直後は購読再配信がまだ処理されていない（楽観的更新なし）
        assert!(repository.list_by_owner("u1").is_empty());

        let repo = Arc::clone(&repository);
        wait_until(move || repo.list_by_owner("u1").len() == 1).await;
    }

    #[tokio::test]
    async fn test_cloud_all_clients_observe_each_write() {
        let backend = Arc::new(MemoryDocumentStore::new());
        let writer = make_cloud_repository(Arc::clone(&backend)).await;
        let observer = make_cloud_repository(Arc::clone(&backend)).await;

        writer
            .create(make_expense("e1", "u1", "2024-06-01T10:00:00+09:00"))
            .await
            .unwrap();

        // 書き込んだクライアントも他のクライアントも購読経由で観測する
        let repo = Arc::clone(&writer);
        wait_until(move || repo.list_by_owner("u1").len() == 1).await;
        let repo = Arc::clone(&observer);
        wait_until(move || repo.list_by_owner("u1").len() == 1).await;
    }

    #[tokio::test]
    async fn test_cloud_snapshot_is_resorted_newest_first() {
        let backend = Arc::new(MemoryDocumentStore::new());

        // 配信順が作成順と一致しないケースを直接バックエンドに用意する
        backend
            .put(
                EXPENSES_COLLECTION,
                "e1",
                serde_json::to_value(make_expense("e1", "u1", "2024-06-01T10:00:00+09:00"))
                    .unwrap(),
            )
            .await
            .unwrap();
        backend
            .put(
                EXPENSES_COLLECTION,
                "e3",
                serde_json::to_value(make_expense("e3", "u1", "2024-06-01T12:00:00+09:00"))
                    .unwrap(),
            )
            .await
            .unwrap();
        backend
            .put(
                EXPENSES_COLLECTION,
                "e2",
                serde_json::to_value(make_expense("e2", "u1", "2024-06-01T11:00:00+09:00"))
                    .unwrap(),
            )
            .await
            .unwrap();

        let repository = make_cloud_repository(backend).await;
        let repo = Arc::clone(&repository);
        wait_until(move || repo.list_all().len() == 3).await;

        let ids: Vec<String> = repository
            .list_all()
            .iter()
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(ids, vec!["e3", "e2", "e1"]);
    }

    #[tokio::test]
    async fn test_cloud_delete_by_owner_is_single_bulk_operation() {
        let backend = Arc::new(MemoryDocumentStore::new());
        let repository = make_cloud_repository(Arc::clone(&backend)).await;

        repository
            .create(make_expense("e1", "alice", "2024-06-01T10:00:00+09:00"))
            .await
            .unwrap();
        repository
            .create(make_expense("e2", "bob", "2024-06-01T11:00:00+09:00"))
            .await
            .unwrap();
        repository
            .create(make_expense("e3", "alice", "2024-06-01T12:00:00+09:00"))
            .await
            .unwrap();

        let repo = Arc::clone(&repository);
        wait_until(move || repo.list_all().len() == 3).await;

        repository.delete_by_owner("alice").await.unwrap();

        let repo = Arc::clone(&repository);
        wait_until(move || repo.list_all().len() == 1).await;
        assert_eq!(repository.list_all()[0].user_id, "bob");
    }

    /// 作成の系列がどんな間隔で起きても、一覧は常に作成日時の降順になる
    #[quickcheck_macros::quickcheck]
    fn prop_creation_sequences_list_reverse_chronologically(gaps: Vec<u8>) -> bool {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let kv = Arc::new(MemoryKeyValueStore::unbounded());
            let repository = make_local_repository(kv).await;

            let base = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
            let mut elapsed_minutes = 0i64;

            for (index, gap) in gaps.iter().enumerate() {
                elapsed_minutes += i64::from(*gap) + 1;
                let created_at = (base + Duration::minutes(elapsed_minutes)).to_rfc3339();
                repository
                    .create(make_expense(&format!("e{index}"), "u1", &created_at))
                    .await
                    .unwrap();
            }

            let listed = repository.list_by_owner("u1");
            listed.windows(2).all(|pair| {
                parse_rfc3339_or_epoch(&pair[0].created_at)
                    >= parse_rfc3339_or_epoch(&pair[1].created_at)
            })
        })
    }
}
