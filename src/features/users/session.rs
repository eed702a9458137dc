use crate::features::users::models::User;
use crate::features::users::repository::UserRepository;
use crate::shared::errors::AppResult;
use crate::shared::storage::KeyValueStore;
use std::sync::{Arc, Mutex};

/// セッショントークン（ユーザーID）を保存するキー
pub const SESSION_KEY: &str = "keihi.session_user";

/// セッション管理
///
/// 現在の認証済みユーザーは「永続化されたユーザーID + ユーザー
/// リポジトリのライブな状態」から導出する。トークンのIDがコレクション
/// から解決できなくなった場合（他クライアントによる削除を購読で観測した
/// 場合を含む）、セッションは副作用として終了する。
pub struct SessionManager {
    users: Arc<UserRepository>,
    kv: Arc<dyn KeyValueStore>,
    current_user_id: Mutex<Option<String>>,
}

impl SessionManager {
    /// セッションマネージャーを作成し、保存済みセッションを復元する
    ///
    /// # 引数
    /// * `users` - ユーザーリポジトリ
    /// * `kv` - セッショントークンの保存先
    pub fn new(users: Arc<UserRepository>, kv: Arc<dyn KeyValueStore>) -> Self {
        // 前回セッションのユーザーIDを復元する（検証はcurrent_userで行う）
        let restored = match kv.get(SESSION_KEY) {
            Ok(stored) => stored,
            Err(e) => {
                log::warn!("セッショントークンの読み込みに失敗しました: {e}");
                None
            }
        };

        if let Some(user_id) = &restored {
            log::info!("保存済みセッションを復元しました: user_id={user_id}");
        }

        Self {
            users,
            kv,
            current_user_id: Mutex::new(restored),
        }
    }

    /// セッショントークンを保存する（失敗しても致命的ではない）
    fn store_token(&self, user_id: &str) {
        if let Err(e) = self.kv.set(SESSION_KEY, user_id) {
            log::warn!("セッショントークンの保存に失敗しました: {e}");
        }
    }

    /// セッショントークンを破棄する
    fn clear_token(&self) {
        if let Err(e) = self.kv.remove(SESSION_KEY) {
            log::warn!("セッショントークンの削除に失敗しました: {e}");
        }
    }

    /// ログインしてセッションを確立する
    ///
    /// # 戻り値
    /// 認証に成功した場合はユーザー、失敗した場合はNone
    pub fn login(&self, email: &str, password: &str) -> Option<User> {
        let user = self.users.login(email, password)?;

        if let Ok(mut current) = self.current_user_id.lock() {
            *current = Some(user.id.clone());
        }
        self.store_token(&user.id);

        Some(user)
    }

    /// サインアップしてセッションを確立する
    ///
    /// # 戻り値
    /// 作成されたユーザー。メールアドレスが登録済みの場合はエラー
    /// （呼び出し側でユーザー向けメッセージとして表示する）
    pub async fn signup(&self, name: &str, email: &str, password: &str) -> AppResult<User> {
        let user = self.users.signup(name, email, password).await?;

        if let Ok(mut current) = self.current_user_id.lock() {
            *current = Some(user.id.clone());
        }
        self.store_token(&user.id);

        Ok(user)
    }

    /// ログアウトしてセッションを終了する
    pub fn logout(&self) {
        if let Ok(mut current) = self.current_user_id.lock() {
            *current = None;
        }
        self.clear_token();
        log::info!("ログアウトしました");
    }

    /// 現在の認証済みユーザーを取得する
    ///
    /// # 戻り値
    /// 認証済みユーザー、セッションがなければNone
    ///
    /// # 処理内容
    /// トークンのユーザーIDを毎回ライブなコレクションから解決する。
    /// 他のユーザーが存在するのにIDが解決できない場合はアカウントが
    /// 削除されたとみなし、セッションを終了する。コレクションが空の
    /// 場合は「未ロード」と区別できないため、トークンは保持したまま
    /// Noneを返す。
    pub fn current_user(&self) -> Option<User> {
        let user_id = self
            .current_user_id
            .lock()
            .ok()
            .and_then(|current| current.clone())?;

        match self.users.find_by_id(&user_id) {
            Some(user) => Some(user),
            None => {
                if self.users.count() > 0 {
                    log::info!(
                        "セッションのユーザーが削除されたため、セッションを終了します: user_id={user_id}"
                    );
                    if let Ok(mut current) = self.current_user_id.lock() {
                        *current = None;
                    }
                    self.clear_token();
                }
                None
            }
        }
    }

    /// ログイン中かどうか
    pub fn is_logged_in(&self) -> bool {
        self.current_user().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::expenses::repository::ExpenseRepository;
    use crate::shared::storage::{LocalStore, MemoryKeyValueStore, RecordStore};

    /// ローカルモードのセッション環境を作成する
    async fn make_session(
        kv: Arc<MemoryKeyValueStore>,
    ) -> (SessionManager, Arc<UserRepository>, Arc<ExpenseRepository>) {
        let store: Arc<dyn RecordStore> =
            Arc::new(LocalStore::new(Arc::clone(&kv) as Arc<dyn KeyValueStore>));
        let expenses = ExpenseRepository::initialize(Arc::clone(&store))
            .await
            .unwrap();
        let users = UserRepository::initialize(store).await.unwrap();
        let session = SessionManager::new(Arc::clone(&users), kv as Arc<dyn KeyValueStore>);
        (session, users, expenses)
    }

    #[tokio::test]
    async fn test_login_establishes_and_persists_session() {
        let kv = Arc::new(MemoryKeyValueStore::unbounded());
        let (session, _users, _expenses) = make_session(Arc::clone(&kv)).await;

        assert!(!session.is_logged_in());

        let user = session.login("admin@example.com", "admin123").unwrap();
        assert_eq!(session.current_user().unwrap().id, user.id);

        // トークンはユーザーIDの素の文字列として保存される
        assert_eq!(kv.get(SESSION_KEY).unwrap(), Some(user.id));
    }

    #[tokio::test]
    async fn test_login_failure_does_not_establish_session() {
        let kv = Arc::new(MemoryKeyValueStore::unbounded());
        let (session, _users, _expenses) = make_session(kv).await;

        assert!(session.login("admin@example.com", "wrong").is_none());
        assert!(!session.is_logged_in());
    }

    #[tokio::test]
    async fn test_session_restored_across_restart() {
        let kv = Arc::new(MemoryKeyValueStore::unbounded());

        let user_id = {
            let (session, _users, _expenses) = make_session(Arc::clone(&kv)).await;
            session.login("manager@example.com", "manager123").unwrap().id
        };

        // 再起動相当: 同じストレージから新しいセッションを構築する
        let (session, _users, _expenses) = make_session(kv).await;
        assert_eq!(session.current_user().unwrap().id, user_id);
    }

    #[tokio::test]
    async fn test_logout_clears_token() {
        let kv = Arc::new(MemoryKeyValueStore::unbounded());
        let (session, _users, _expenses) = make_session(Arc::clone(&kv)).await;

        session.login("admin@example.com", "admin123").unwrap();
        session.logout();

        assert!(!session.is_logged_in());
        assert_eq!(kv.get(SESSION_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_signup_establishes_session() {
        let kv = Arc::new(MemoryKeyValueStore::unbounded());
        let (session, _users, _expenses) = make_session(kv).await;

        let user = session
            .signup("新規ユーザー", "new@example.com", "pw")
            .await
            .unwrap();
        assert_eq!(session.current_user().unwrap().id, user.id);
    }

    #[tokio::test]
    async fn test_session_terminates_when_user_deleted() {
        let kv = Arc::new(MemoryKeyValueStore::unbounded());
        let (session, users, expenses) = make_session(Arc::clone(&kv)).await;

        let sales = session.login("sales@example.com", "sales123").unwrap();

        // 管理者が別経路でこのユーザーを削除する
        let admin = users.find_by_email("admin@example.com").unwrap();
        users
            .delete_user(&sales.id, &admin.id, &expenses)
            .await
            .unwrap();

        // セッションは副作用として終了し、トークンも消える
        assert!(session.current_user().is_none());
        assert_eq!(kv.get(SESSION_KEY).unwrap(), None);
    }
}
