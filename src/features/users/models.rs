use crate::features::users::avatar::avatar_url_for;
use serde::{Deserialize, Serialize};

/// ユーザーの役割
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRole {
    /// 営業（経費の申請者）
    Sales,
    /// 承認者
    Manager,
    /// 管理者
    Admin,
}

/// 承認待ちのプロフィール変更申請
///
/// 名前とメールアドレスの変更は直接反映されず、管理者の承認を経て
/// 初めてライブのフィールドに反映される。1ユーザーにつき同時に存在
/// できる申請は1件だけで、申請中に再申請すると前の申請を上書きする
/// （キューイングもマージもしない）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingProfileUpdate {
    /// 変更後の表示名
    pub name: String,
    /// 変更後のメールアドレス
    pub email: String,
    /// 申請日時（RFC3339形式）
    pub requested_at: String,
}

/// ユーザーアカウント
///
/// メールアドレスがログインキーで、比較は大文字小文字を区別しない。
/// パスワードは元システムと同じく平文で保持・比較する（既知の弱点として
/// 認識した上で、ログイン時の観測可能な挙動を変えないため踏襲している）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// ユーザーID（サインアップ時に生成）
    pub id: String,
    /// 表示名
    pub name: String,
    /// メールアドレス（ログインキー）
    pub email: String,
    /// パスワード（平文）
    pub password: String,
    /// 役割
    pub role: UserRole,
    /// アバター画像のURL（空文字列の場合あり）
    #[serde(default)]
    pub avatar: String,
    /// 承認待ちのプロフィール変更申請（なければNone）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_update: Option<PendingProfileUpdate>,
}

/// 初回起動時に投入するデモアカウントを作成する
///
/// ローカルモードで保存済みユーザーが1人もいない場合にだけ使われる。
pub fn seed_users() -> Vec<User> {
    let accounts = [
        ("管理者", "admin@example.com", "admin123", UserRole::Admin),
        (
            "承認者 花子",
            "manager@example.com",
            "manager123",
            UserRole::Manager,
        ),
        (
            "営業 太郎",
            "sales@example.com",
            "sales123",
            UserRole::Sales,
        ),
    ];

    accounts
        .iter()
        .map(|(name, email, password, role)| User {
            id: crate::shared::utils::nanoid::generate_user_id(),
            name: (*name).to_string(),
            email: (*email).to_string(),
            password: (*password).to_string(),
            role: *role,
            avatar: avatar_url_for(email),
            pending_update: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_serialization_uses_camel_case() {
        let user = User {
            id: "u1".to_string(),
            name: "営業 太郎".to_string(),
            email: "taro@example.com".to_string(),
            password: "pw".to_string(),
            role: UserRole::Sales,
            avatar: String::new(),
            pending_update: Some(PendingProfileUpdate {
                name: "営業 次郎".to_string(),
                email: "jiro@example.com".to_string(),
                requested_at: "2024-06-01T12:00:00+09:00".to_string(),
            }),
        };

        let json = serde_json::to_string(&user).unwrap();
        assert!(json.contains("\"pendingUpdate\""));
        assert!(json.contains("\"requestedAt\""));

        let deserialized: User = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, user);
    }

    #[test]
    fn test_pending_update_absent_is_omitted() {
        let user = User {
            id: "u1".to_string(),
            name: "営業 太郎".to_string(),
            email: "taro@example.com".to_string(),
            password: "pw".to_string(),
            role: UserRole::Sales,
            avatar: String::new(),
            pending_update: None,
        };

        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("pendingUpdate"));

        // pendingUpdateがnullのドキュメントもNoneとして読める
        let with_null = r#"{
            "id": "u1", "name": "営業 太郎", "email": "taro@example.com",
            "password": "pw", "role": "Sales", "avatar": "",
            "pendingUpdate": null
        }"#;
        let parsed: User = serde_json::from_str(with_null).unwrap();
        assert_eq!(parsed.pending_update, None);
    }

    #[test]
    fn test_seed_users_cover_all_roles() {
        let seeds = seed_users();
        assert_eq!(seeds.len(), 3);

        assert!(seeds.iter().any(|u| u.role == UserRole::Admin));
        assert!(seeds.iter().any(|u| u.role == UserRole::Manager));
        assert!(seeds.iter().any(|u| u.role == UserRole::Sales));

        // 各アカウントにIDとアバターが設定されている
        for user in &seeds {
            assert_eq!(user.id.len(), 21);
            assert!(user.avatar.starts_with("https://"));
            assert!(user.pending_update.is_none());
        }
    }
}
