use crate::features::expenses::repository::ExpenseRepository;
use crate::features::users::avatar::avatar_url_for;
use crate::features::users::models::{seed_users, PendingProfileUpdate, User, UserRole};
use crate::shared::errors::{AppError, AppResult};
use crate::shared::storage::{
    ChangeHandler, JsonMap, RecordStore, StoreMode, Subscription, WriteAck,
};
use crate::shared::utils::nanoid::generate_user_id;
use crate::shared::utils::{get_current_jst_timestamp, validate_required_field};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};

/// ユーザーコレクションの名前
pub const USERS_COLLECTION: &str = "users";

/// ユーザーレコードに画像ペイロードのフィールドはない
/// （avatarはURL参照でdata-URIではない）
const USER_IMAGE_FIELDS: &[&str] = &[];

/// メールアドレスの形式チェック
static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("メール正規表現が不正"));

/// ユーザーアカウントのリポジトリ
///
/// インメモリのユーザーコレクションを排他的に所有し、ログイン・
/// サインアップ・プロフィール変更申請の承認フローを提供する。
/// コレクションの反映タイミングは経費リポジトリと同じ契約
/// （クラウド: 購読再配信、ローカル: 同期反映+スナップショット永続化）。
pub struct UserRepository {
    store: Arc<dyn RecordStore>,
    users: Arc<Mutex<Vec<User>>>,
    subscription: Mutex<Option<Subscription>>,
}

impl UserRepository {
    /// リポジトリを構築してコレクションの購読を開始する
    ///
    /// # 処理内容
    /// ローカルモードで保存済みユーザーが1人もいない場合は、デモ
    /// アカウントを投入する（クラウドモードでは投入しない。空の
    /// コレクションへの投入が複数クライアント間で競合するため）。
    pub async fn initialize(store: Arc<dyn RecordStore>) -> AppResult<Arc<Self>> {
        let repository = Arc::new(Self {
            store: Arc::clone(&store),
            users: Arc::new(Mutex::new(Vec::new())),
            subscription: Mutex::new(None),
        });

        let shared = Arc::clone(&repository.users);
        let handler: ChangeHandler = Box::new(move |documents| {
            let records: Vec<User> = documents
                .into_iter()
                .filter_map(|doc| match serde_json::from_value::<User>(doc) {
                    Ok(user) => Some(user),
                    Err(e) => {
                        log::warn!("解析できないユーザーレコードを無視します: {e}");
                        None
                    }
                })
                .collect();

            match shared.lock() {
                Ok(mut collection) => *collection = records,
                Err(e) => log::error!("ユーザーコレクションのロック取得に失敗しました: {e}"),
            }
        });

        let subscription = store.subscribe(USERS_COLLECTION, handler).await?;
        *repository
            .subscription
            .lock()
            .map_err(|e| AppError::concurrency(format!("購読ハンドルのロック取得失敗: {e}")))? =
            Some(subscription);

        // 初回起動時のデモアカウント投入（ローカルモードのみ）
        if repository.store.mode() == StoreMode::Local && repository.count() == 0 {
            repository.seed_default_users().await?;
        }

        Ok(repository)
    }

    /// デモアカウントを投入する
    async fn seed_default_users(&self) -> AppResult<()> {
        log::info!("保存済みユーザーが存在しないため、デモアカウントを投入します");

        for user in seed_users() {
            let document = serde_json::to_value(&user)?;
            let ack = self.store.put(USERS_COLLECTION, &user.id, document).await?;
            if ack == WriteAck::Applied {
                self.lock_users()?.push(user);
            }
        }

        self.persist_snapshot().await
    }

    fn lock_users(&self) -> AppResult<MutexGuard<'_, Vec<User>>> {
        self.users
            .lock()
            .map_err(|e| AppError::concurrency(format!("ユーザーコレクションのロック取得失敗: {e}")))
    }

    /// 現在のコレクション全体をスナップショットとして永続化する
    async fn persist_snapshot(&self) -> AppResult<()> {
        let documents: Vec<Value> = {
            let users = self.lock_users()?;
            users
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?
        };

        self.store
            .persist(USERS_COLLECTION, &documents, USER_IMAGE_FIELDS)
            .await?;

        Ok(())
    }

    /// 登録ユーザー数を取得する
    pub fn count(&self) -> usize {
        match self.lock_users() {
            Ok(users) => users.len(),
            Err(e) => {
                log::error!("ユーザー数の取得に失敗しました: {e}");
                0
            }
        }
    }

    /// 全ユーザーの一覧を取得する（管理画面用）
    pub fn list_all(&self) -> Vec<User> {
        match self.lock_users() {
            Ok(users) => users.clone(),
            Err(e) => {
                log::error!("ユーザー一覧の取得に失敗しました: {e}");
                Vec::new()
            }
        }
    }

    /// IDでユーザーを取得する
    pub fn find_by_id(&self, user_id: &str) -> Option<User> {
        match self.lock_users() {
            Ok(users) => users.iter().find(|u| u.id == user_id).cloned(),
            Err(e) => {
                log::error!("ユーザーの取得に失敗しました: {e}");
                None
            }
        }
    }

    /// メールアドレスでユーザーを取得する（大文字小文字を区別しない）
    pub fn find_by_email(&self, email: &str) -> Option<User> {
        let needle = email.trim().to_lowercase();
        match self.lock_users() {
            Ok(users) => users
                .iter()
                .find(|u| u.email.to_lowercase() == needle)
                .cloned(),
            Err(e) => {
                log::error!("ユーザーの取得に失敗しました: {e}");
                None
            }
        }
    }

    /// メールアドレスが既に登録済みかどうか（大文字小文字を区別しない）
    pub fn email_exists(&self, email: &str) -> bool {
        self.find_by_email(email).is_some()
    }

    /// ログイン認証を行う
    ///
    /// # 引数
    /// * `email` - メールアドレス（大文字小文字を区別しない）
    /// * `password` - パスワード（平文の完全一致）
    ///
    /// # 戻り値
    /// 認証に成功した場合はユーザー、失敗した場合はNone
    pub fn login(&self, email: &str, password: &str) -> Option<User> {
        let user = self.find_by_email(email)?;

        if user.password == password {
            log::info!("ログインしました: user_id={}", user.id);
            Some(user)
        } else {
            log::info!("パスワードが一致しませんでした: email={email}");
            None
        }
    }

    /// 新規アカウントを作成する
    ///
    /// # 引数
    /// * `name` - 表示名
    /// * `email` - メールアドレス
    /// * `password` - パスワード
    ///
    /// # 戻り値
    /// 作成されたユーザー（Sales役割、決定的に生成したアバターURL付き）。
    /// メールアドレスが登録済みの場合はバリデーションエラー
    ///
    /// # 注意
    /// 重複チェックは現在のコレクションに対する検査であり、ストレージ側の
    /// 一意性制約ではない。同じメールアドレスでの同時サインアップが
    /// 別クライアントで競合した場合は検出できない。
    pub async fn signup(&self, name: &str, email: &str, password: &str) -> AppResult<User> {
        validate_required_field(name, "名前")?;
        validate_required_field(email, "メールアドレス")?;
        validate_required_field(password, "パスワード")?;

        if !EMAIL_RE.is_match(email.trim()) {
            return Err(AppError::validation(
                "メールアドレスの形式が正しくありません",
            ));
        }

        if self.email_exists(email) {
            return Err(AppError::validation(
                "このメールアドレスは既に登録されています",
            ));
        }

        let user = User {
            id: generate_user_id(),
            name: name.trim().to_string(),
            email: email.trim().to_string(),
            password: password.to_string(),
            role: UserRole::Sales,
            avatar: avatar_url_for(email),
            pending_update: None,
        };

        let document = serde_json::to_value(&user)?;
        let ack = self.store.put(USERS_COLLECTION, &user.id, document).await?;

        if ack == WriteAck::Applied {
            self.lock_users()?.push(user.clone());
            self.persist_snapshot().await?;
        }

        log::info!("アカウントを作成しました: user_id={}", user.id);
        Ok(user)
    }

    /// フィールドpatchを発行して、必要ならローカル反映と永続化を行う
    ///
    /// 対象ユーザーが存在しない場合は何もしない。
    async fn patch_user<F>(&self, user_id: &str, fields: JsonMap, apply: F) -> AppResult<()>
    where
        F: FnOnce(&mut User),
    {
        let ack = self.store.patch(USERS_COLLECTION, user_id, fields).await?;

        if ack == WriteAck::Applied {
            let changed = {
                let mut users = self.lock_users()?;
                match users.iter_mut().find(|u| u.id == user_id) {
                    Some(user) => {
                        apply(user);
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

    /// ユーザーの役割を変更する
    ///
    /// # 引数
    /// * `user_id` - 対象ユーザーのID
    /// * `role` - 新しい役割
    /// * `acting_user_id` - 操作しているユーザーのID
    ///
    /// # 注意
    /// 自分自身の役割は変更できない（呼び出し側のガードに加えて、
    /// リポジトリ境界でも安全のため拒否する）。
    pub async fn update_role(
        &self,
        user_id: &str,
        role: UserRole,
        acting_user_id: &str,
    ) -> AppResult<()> {
        if user_id == acting_user_id {
            return Err(AppError::validation("自分自身の役割は変更できません"));
        }

        let mut fields = JsonMap::new();
        fields.insert("role".to_string(), serde_json::to_value(role)?);

        self.patch_user(user_id, fields, |user| user.role = role)
            .await
    }

    /// アバターURLを変更する
    pub async fn update_avatar(&self, user_id: &str, avatar: &str) -> AppResult<()> {
        let mut fields = JsonMap::new();
        fields.insert("avatar".to_string(), serde_json::to_value(avatar)?);

        let avatar = avatar.to_string();
        self.patch_user(user_id, fields, move |user| user.avatar = avatar)
            .await
    }

    /// パスワードを変更する
    pub async fn update_password(&self, user_id: &str, password: &str) -> AppResult<()> {
        validate_required_field(password, "パスワード")?;

        let mut fields = JsonMap::new();
        fields.insert("password".to_string(), serde_json::to_value(password)?);

        let password = password.to_string();
        self.patch_user(user_id, fields, move |user| user.password = password)
            .await
    }

    /// プロフィール変更を申請する
    ///
    /// 名前とメールアドレスの変更案を承認待ちとして登録する。ライブの
    /// フィールドはこの時点では変わらない。既に申請がある場合は
    /// 上書きする（後勝ち、マージしない）。
    pub async fn request_profile_update(
        &self,
        user_id: &str,
        name: &str,
        email: &str,
    ) -> AppResult<()> {
        validate_required_field(name, "名前")?;
        validate_required_field(email, "メールアドレス")?;

        let pending = PendingProfileUpdate {
            name: name.trim().to_string(),
            email: email.trim().to_string(),
            requested_at: get_current_jst_timestamp(),
        };

        let mut fields = JsonMap::new();
        fields.insert("pendingUpdate".to_string(), serde_json::to_value(&pending)?);

        self.patch_user(user_id, fields, move |user| {
            user.pending_update = Some(pending)
        })
        .await
    }

    /// プロフィール変更申請を承認または却下する
    ///
    /// # 引数
    /// * `user_id` - 対象ユーザーのID
    /// * `approve` - trueなら承認（申請内容をライブのフィールドへ反映）、
    ///   falseなら却下（申請を破棄するだけ）
    ///
    /// # 注意
    /// どちらの場合も申請はクリアされる。申請が存在しない場合は何もしない。
    pub async fn resolve_profile_update(&self, user_id: &str, approve: bool) -> AppResult<()> {
        // 現在の申請内容を読み取る（なければ無操作）
        let Some(pending) = self
            .find_by_id(user_id)
            .and_then(|user| user.pending_update)
        else {
            return Ok(());
        };

        let mut fields = JsonMap::new();
        if approve {
            fields.insert("name".to_string(), serde_json::to_value(&pending.name)?);
            fields.insert("email".to_string(), serde_json::to_value(&pending.email)?);
        }
        fields.insert("pendingUpdate".to_string(), Value::Null);

        self.patch_user(user_id, fields, move |user| {
            if approve {
                user.name = pending.name;
                user.email = pending.email;
            }
            user.pending_update = None;
        })
        .await
    }

    /// ユーザーを削除する
    ///
    /// # 引数
    /// * `user_id` - 削除するユーザーのID
    /// * `acting_user_id` - 操作しているユーザーのID
    /// * `expenses` - 経費リポジトリ（カスケード削除用）
    ///
    /// # 戻り値
    /// 削除した場合はtrue、対象が存在しなかった場合はfalse
    ///
    /// # 処理内容
    /// 所有する経費のカスケード削除をユーザー削除より先に発行する。
    /// この順序でないと、クラッシュ時に所有者参照が宙に浮いた経費が残る。
    /// 自分自身は削除できない。
    pub async fn delete_user(
        &self,
        user_id: &str,
        acting_user_id: &str,
        expenses: &ExpenseRepository,
    ) -> AppResult<bool> {
        if user_id == acting_user_id {
            return Err(AppError::validation("自分自身は削除できません"));
        }

        if self.find_by_id(user_id).is_none() {
            return Ok(false);
        }

        // カスケードを先に発行する
        expenses.delete_by_owner(user_id).await?;

        let ack = self.store.delete(USERS_COLLECTION, user_id).await?;

        if ack == WriteAck::Applied {
            {
                let mut users = self.lock_users()?;
                users.retain(|u| u.id != user_id);
            }
            self.persist_snapshot().await?;
        }

        log::info!("ユーザーを削除しました: user_id={user_id}");
        Ok(true)
    }

    /// 購読を解放する
    pub fn shutdown(&self) {
        if let Ok(mut subscription) = self.subscription.lock() {
            if let Some(handle) = subscription.take() {
                handle.unsubscribe();
            }
        }
    }
}
