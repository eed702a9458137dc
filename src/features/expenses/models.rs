use crate::shared::errors::AppResult;
use crate::shared::storage::JsonMap;
use crate::shared::utils::{
    validate_amount, validate_date, validate_required_field, validate_text_length,
};
use serde::{Deserialize, Serialize};

/// 経費カテゴリ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpenseCategory {
    Restaurant,
    Hotel,
    Transport,
    Supplies,
    Mileage,
    Fuel,
    Parking,
    Miscellaneous,
}

impl ExpenseCategory {
    /// レシート読み取り結果の文字列をカテゴリに変換する
    ///
    /// 大文字小文字は区別せず、どのカテゴリにも一致しない場合は
    /// Miscellaneousとして扱う（読み取り結果を理由に失敗させない）。
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "restaurant" => ExpenseCategory::Restaurant,
            "hotel" => ExpenseCategory::Hotel,
            "transport" => ExpenseCategory::Transport,
            "supplies" => ExpenseCategory::Supplies,
            "mileage" => ExpenseCategory::Mileage,
            "fuel" => ExpenseCategory::Fuel,
            "parking" => ExpenseCategory::Parking,
            _ => ExpenseCategory::Miscellaneous,
        }
    }
}

/// 経費の承認ステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpenseStatus {
    /// 申請済み（承認待ち）
    Submitted,
    /// 承認済み
    Approved,
    /// 差し戻し
    Rejected,
}

/// 経費データモデル
///
/// フィールド名はドキュメントストア上の表現（camelCase）が契約。
/// `user_name`は作成時点のユーザー表示名のスナップショットであり、
/// 後からユーザーが改名されても書き換えない。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    /// レコードID（呼び出し側が生成するグローバル一意な文字列）
    pub id: String,
    /// 所有ユーザーのID
    pub user_id: String,
    /// 所有ユーザーの表示名（作成時点のスナップショット）
    pub user_name: String,
    /// 店舗名
    pub merchant: String,
    /// 利用日（YYYY-MM-DD形式）
    pub date: String,
    /// 小計
    pub subtotal: f64,
    /// 税額
    pub tax: f64,
    /// 合計
    ///
    /// 読み取り結果が不整合な場合もあるため、小計+税額=合計の
    /// 整合性チェックは行わない（各フィールドは独立に編集できる）。
    pub total: f64,
    /// カテゴリ
    pub category: ExpenseCategory,
    /// レシート画像（data-URI、空文字列の場合あり）
    #[serde(default)]
    pub receipt_image: String,
    /// 承認ステータス
    pub status: ExpenseStatus,
    /// メモ
    #[serde(default)]
    pub notes: String,
    /// 作成日時（RFC3339形式、作成時に一度だけ設定、以後不変）
    pub created_at: String,
}

impl Expense {
    /// 経費レコード用のIDを生成する
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// フィールドの内容を検証する
    pub fn validate(&self) -> AppResult<()> {
        validate_required_field(&self.id, "経費ID")?;
        validate_required_field(&self.user_id, "ユーザーID")?;
        validate_date(&self.date)?;
        validate_amount(self.subtotal)?;
        validate_amount(self.tax)?;
        validate_amount(self.total)?;
        validate_text_length(&self.merchant, 200, "店舗名")?;
        validate_text_length(&self.notes, 500, "メモ")?;
        Ok(())
    }
}

/// 経費更新用DTO
///
/// ID・所有者・作成日時は不変のため含まない。ステータスは承認フローの
/// 専用操作で遷移させるため、ここからは変更できない。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateExpenseDto {
    pub merchant: Option<String>,
    pub date: Option<String>,
    pub subtotal: Option<f64>,
    pub tax: Option<f64>,
    pub total: Option<f64>,
    pub category: Option<ExpenseCategory>,
    pub receipt_image: Option<String>,
    pub notes: Option<String>,
}

impl UpdateExpenseDto {
    /// 更新対象のフィールドが1つもないかどうか
    pub fn is_empty(&self) -> bool {
        self.merchant.is_none()
            && self.date.is_none()
            && self.subtotal.is_none()
            && self.tax.is_none()
            && self.total.is_none()
            && self.category.is_none()
            && self.receipt_image.is_none()
            && self.notes.is_none()
    }

    /// 指定されたフィールドだけを含むpatch用マップを作る
    ///
    /// キーはドキュメントストア上のフィールド名（camelCase）。
    pub fn to_patch_map(&self) -> AppResult<JsonMap> {
        let mut fields = JsonMap::new();

        if let Some(merchant) = &self.merchant {
            fields.insert("merchant".to_string(), serde_json::to_value(merchant)?);
        }
        if let Some(date) = &self.date {
            fields.insert("date".to_string(), serde_json::to_value(date)?);
        }
        if let Some(subtotal) = self.subtotal {
            fields.insert("subtotal".to_string(), serde_json::to_value(subtotal)?);
        }
        if let Some(tax) = self.tax {
            fields.insert("tax".to_string(), serde_json::to_value(tax)?);
        }
        if let Some(total) = self.total {
            fields.insert("total".to_string(), serde_json::to_value(total)?);
        }
        if let Some(category) = self.category {
            fields.insert("category".to_string(), serde_json::to_value(category)?);
        }
        if let Some(receipt_image) = &self.receipt_image {
            fields.insert(
                "receiptImage".to_string(),
                serde_json::to_value(receipt_image)?,
            );
        }
        if let Some(notes) = &self.notes {
            fields.insert("notes".to_string(), serde_json::to_value(notes)?);
        }

        Ok(fields)
    }

    /// 指定されたフィールドだけを既存レコードに適用する
    ///
    /// 指定されていないフィールドは既存の値を保持する。
    pub fn apply_to(&self, expense: &mut Expense) {
        if let Some(merchant) = &self.merchant {
            expense.merchant = merchant.clone();
        }
        if let Some(date) = &self.date {
            expense.date = date.clone();
        }
        if let Some(subtotal) = self.subtotal {
            expense.subtotal = subtotal;
        }
        if let Some(tax) = self.tax {
            expense.tax = tax;
        }
        if let Some(total) = self.total {
            expense.total = total;
        }
        if let Some(category) = self.category {
            expense.category = category;
        }
        if let Some(receipt_image) = &self.receipt_image {
            expense.receipt_image = receipt_image.clone();
        }
        if let Some(notes) = &self.notes {
            expense.notes = notes.clone();
        }
    }
}
