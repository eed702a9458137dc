pub mod nanoid;

use crate::shared::errors::{AppError, AppResult};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use chrono_tz::Asia::Tokyo;

/// 日付文字列のバリデーション
///
/// # 引数
/// * `date_str` - 日付文字列（YYYY-MM-DD形式）
///
/// # 戻り値
/// 有効な日付の場合はOk(())、無効な場合はエラー
///
/// # バリデーション規則
/// - YYYY-MM-DD形式であること
/// - 実在する日付であること
/// - 1900年以降、2100年以前であること
pub fn validate_date(date_str: &str) -> AppResult<()> {
    // 基本的な形式チェック
    if date_str.len() != 10 {
        return Err(AppError::validation(
            "日付はYYYY-MM-DD形式で入力してください",
        ));
    }

    // ハイフンの位置チェック
    if (date_str.chars().nth(4) != Some('-')) || (date_str.chars().nth(7) != Some('-')) {
        return Err(AppError::validation(
            "日付はYYYY-MM-DD形式で入力してください",
        ));
    }

    // 日付として解析可能かチェック
    let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
        .map_err(|_| AppError::validation("無効な日付です"))?;

    // 年の範囲チェック
    let year = date.year();
    if !(1900..=2100).contains(&year) {
        return Err(AppError::validation(
            "日付は1900年から2100年の間で入力してください",
        ));
    }

    Ok(())
}

/// 金額のバリデーション
///
/// # 引数
/// * `amount` - 金額
///
/// # 戻り値
/// 有効な金額の場合はOk(())、無効な場合はエラー
///
/// # バリデーション規則
/// - 0以上の数値であること（レシート読み取りが0円を返すケースを許容する）
/// - 10桁以内であること
pub fn validate_amount(amount: f64) -> AppResult<()> {
    // 無限大・NaNチェック
    if !amount.is_finite() {
        return Err(AppError::validation("無効な金額です"));
    }

    // 非負チェック
    if amount < 0.0 {
        return Err(AppError::validation("金額は0以上で入力してください"));
    }

    // 上限チェック（10桁以内）
    if amount >= 10_000_000_000.0 {
        return Err(AppError::validation("金額は10桁以内で入力してください"));
    }

    Ok(())
}

/// 文字列の長さバリデーション
///
/// # 引数
/// * `text` - 検証対象の文字列
/// * `max_length` - 最大文字数
/// * `field_name` - フィールド名（エラーメッセージ用）
///
/// # 戻り値
/// 有効な長さの場合はOk(())、無効な場合はエラー
pub fn validate_text_length(text: &str, max_length: usize, field_name: &str) -> AppResult<()> {
    let char_count = text.chars().count();
    if char_count > max_length {
        return Err(AppError::validation(format!(
            "{field_name}は{max_length}文字以内で入力してください（現在: {char_count}文字）"
        )));
    }
    Ok(())
}

/// 必須フィールドのバリデーション
///
/// # 引数
/// * `text` - 検証対象の文字列
/// * `field_name` - フィールド名（エラーメッセージ用）
///
/// # 戻り値
/// 空でない場合はOk(())、空の場合はエラー
pub fn validate_required_field(text: &str, field_name: &str) -> AppResult<()> {
    if text.trim().is_empty() {
        return Err(AppError::validation(format!("{field_name}は必須項目です")));
    }
    Ok(())
}

/// 現在の日時をJST（日本標準時）で取得
///
/// # 戻り値
/// JST形式のRFC3339文字列
pub fn get_current_jst_timestamp() -> String {
    let now_jst = Utc::now().with_timezone(&Tokyo);
    now_jst.to_rfc3339()
}

/// 今日の日付をYYYY-MM-DD形式で取得（JST基準）
///
/// # 戻り値
/// 今日の日付文字列
pub fn get_today_date_jst() -> String {
    let now_jst = Utc::now().with_timezone(&Tokyo);
    now_jst.format("%Y-%m-%d").to_string()
}

/// RFC3339文字列をUTCのDateTimeに変換する（ソート用）
///
/// 解析できない文字列はUNIXエポックとして扱い、ソート時に末尾へ沈める。
/// レコードの並び替えで使用するため、エラーを返さない。
pub fn parse_rfc3339_or_epoch(timestamp: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_date() {
        // 有効な日付
        assert!(validate_date("2024-01-01").is_ok());
        assert!(validate_date("2024-12-31").is_ok());

        // 無効な形式
        assert!(validate_date("2024/01/01").is_err());
        assert!(validate_date("24-01-01").is_err());
        assert!(validate_date("").is_err());

        // 実在しない日付
        assert!(validate_date("2024-02-30").is_err());
        assert!(validate_date("2024-13-01").is_err());

        // 年の範囲外
        assert!(validate_date("1899-12-31").is_err());
        assert!(validate_date("2101-01-01").is_err());
    }

    #[test]
    fn test_validate_amount() {
        // 有効な金額（0円は読み取りフォールバックで発生する）
        assert!(validate_amount(0.0).is_ok());
        assert!(validate_amount(1000.0).is_ok());
        assert!(validate_amount(9_999_999_999.0).is_ok());

        // 無効な金額
        assert!(validate_amount(-1.0).is_err());
        assert!(validate_amount(10_000_000_000.0).is_err());
        assert!(validate_amount(f64::NAN).is_err());
        assert!(validate_amount(f64::INFINITY).is_err());
    }

    #[test]
    fn test_validate_text_length() {
        assert!(validate_text_length("短いメモ", 500, "メモ").is_ok());
        assert!(validate_text_length(&"あ".repeat(501), 500, "メモ").is_err());
    }

    #[test]
    fn test_validate_required_field() {
        assert!(validate_required_field("値あり", "名前").is_ok());
        assert!(validate_required_field("", "名前").is_err());
        assert!(validate_required_field("   ", "名前").is_err());
    }

    #[test]
    fn test_get_current_jst_timestamp() {
        let timestamp = get_current_jst_timestamp();

        // RFC3339として解析可能であることを確認
        assert!(DateTime::parse_from_rfc3339(&timestamp).is_ok());
        // JSTオフセットが付与されていることを確認
        assert!(timestamp.contains("+09:00"));
    }

    #[test]
    fn test_get_today_date_jst() {
        let today = get_today_date_jst();
        assert!(validate_date(&today).is_ok());
    }

    #[test]
    fn test_parse_rfc3339_or_epoch() {
        let parsed = parse_rfc3339_or_epoch("2024-06-01T10:00:00+09:00");
        assert_eq!(parsed.timestamp(), 1717203600);

        // 解析できない文字列はエポックになる
        let fallback = parse_rfc3339_or_epoch("not-a-timestamp");
        assert_eq!(fallback, DateTime::<Utc>::UNIX_EPOCH);
    }
}
