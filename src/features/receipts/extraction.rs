use crate::features::expenses::models::ExpenseCategory;
use crate::shared::config::environment::ExtractionConfig;
use crate::shared::errors::{AppError, AppResult};
use crate::shared::utils::{get_today_date_jst, validate_date};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// レシート読み取り結果
///
/// UIはこの値をレビュー画面の初期値として表示し、ユーザーが修正した上で
/// 経費レコードを作成する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedReceipt {
    /// 店舗名
    pub merchant: String,
    /// 利用日（YYYY-MM-DD形式）
    pub date: String,
    /// 小計
    pub subtotal: f64,
    /// 税額
    pub tax: f64,
    /// 合計
    pub total: f64,
    /// カテゴリ
    pub category: ExpenseCategory,
}

impl ExtractedReceipt {
    /// 読み取りに失敗した場合のフォールバック結果を作る
    ///
    /// 店舗名は空、日付は今日（JST）、金額はすべて0、カテゴリは
    /// Miscellaneous。呼び出し側はこの形だけを前提にすればよく、
    /// 読み取りの失敗を例外として扱う必要がない。
    pub fn fallback() -> Self {
        Self {
            merchant: String::new(),
            date: get_today_date_jst(),
            subtotal: 0.0,
            tax: 0.0,
            total: 0.0,
            category: ExpenseCategory::Miscellaneous,
        }
    }
}

/// 読み取りAPIのレスポンス
#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    merchant: String,
    #[serde(default)]
    date: String,
    #[serde(default)]
    subtotal: f64,
    #[serde(default)]
    tax: f64,
    #[serde(default)]
    total: f64,
    #[serde(default)]
    category: String,
}

/// APIレスポンスを検証済みの読み取り結果へ正規化する
///
/// 不正な日付は今日の日付に、不正な金額は0に落とす。
fn normalize(response: ExtractionResponse) -> ExtractedReceipt {
    let date = if validate_date(&response.date).is_ok() {
        response.date
    } else {
        get_today_date_jst()
    };

    let clamp_amount = |amount: f64| {
        if amount.is_finite() && amount >= 0.0 {
            amount
        } else {
            0.0
        }
    };

    ExtractedReceipt {
        merchant: response.merchant.trim().to_string(),
        date,
        subtotal: clamp_amount(response.subtotal),
        tax: clamp_amount(response.tax),
        total: clamp_amount(response.total),
        category: ExpenseCategory::from_label(&response.category),
    }
}

/// data-URIからMIMEタイプとbase64ペイロードを取り出す
///
/// # 引数
/// * `data_uri` - `data:image/jpeg;base64,....`形式の文字列
///
/// # 戻り値
/// (MIMEタイプ, base64ペイロード)、形式が不正な場合はエラー
fn decode_data_uri(data_uri: &str) -> AppResult<(String, String)> {
    let rest = data_uri
        .strip_prefix("data:")
        .ok_or_else(|| AppError::validation("data:形式のURIではありません"))?;

    let (mime_type, payload) = rest
        .split_once(";base64,")
        .ok_or_else(|| AppError::validation("base64エンコードされたdata URIではありません"))?;

    if mime_type.is_empty() {
        return Err(AppError::validation("MIMEタイプが指定されていません"));
    }

    // ペイロードが正しいbase64であることを確認する
    general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| AppError::validation(format!("base64の復号に失敗しました: {e}")))?;

    Ok((mime_type.to_string(), payload.to_string()))
}

/// レシート読み取りAPIのクライアント
///
/// 圧縮済みのレシート画像（data-URI）を読み取りAPIへ送信し、構造化
/// された結果を受け取る。設定がない・通信に失敗した・レスポンスが
/// 解析できない、いずれの場合もエラーにはならず、フォールバック結果を
/// 返す（読み取り失敗で経費入力を止めない）。
pub struct ReceiptExtractor {
    client: reqwest::Client,
    config: Option<ExtractionConfig>,
}

impl ReceiptExtractor {
    /// 環境変数の設定で読み取りクライアントを作成する
    pub fn new() -> AppResult<Self> {
        Self::with_config(ExtractionConfig::from_env())
    }

    /// 設定を指定して読み取りクライアントを作成する
    pub fn with_config(config: Option<ExtractionConfig>) -> AppResult<Self> {
        let timeout_seconds = config.as_ref().map(|c| c.timeout_seconds).unwrap_or(60);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| AppError::configuration(format!("HTTPクライアント初期化失敗: {e}")))?;

        Ok(Self { client, config })
    }

    /// レシート画像から経費フィールドを読み取る
    ///
    /// # 引数
    /// * `image_data_uri` - 圧縮済みレシート画像のdata-URI
    ///
    /// # 戻り値
    /// 読み取り結果。いかなる失敗でもフォールバック結果を返す
    pub async fn extract(&self, image_data_uri: &str) -> ExtractedReceipt {
        let Some(config) = &self.config else {
            log::debug!("読み取りAPIが設定されていないため、フォールバック結果を返します");
            return ExtractedReceipt::fallback();
        };

        let (mime_type, payload) = match decode_data_uri(image_data_uri) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("レシート画像の形式が不正です: {e}");
                return ExtractedReceipt::fallback();
            }
        };

        match self.request_extraction(config, &mime_type, &payload).await {
            Ok(response) => normalize(response),
            Err(e) => {
                log::warn!("レシート読み取りに失敗したため、フォールバック結果を返します: {e}");
                ExtractedReceipt::fallback()
            }
        }
    }

    /// 読み取りAPIを呼び出す（リトライ付き）
    async fn request_extraction(
        &self,
        config: &ExtractionConfig,
        mime_type: &str,
        payload: &str,
    ) -> AppResult<ExtractionResponse> {
        let body = serde_json::json!({
            "image": payload,
            "mimeType": mime_type,
        });

        let mut request = self.client.post(&config.api_url).json(&body);
        if let Some(key) = &config.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let mut attempts = 0;
        loop {
            let Some(cloned_request) = request.try_clone() else {
                return Err(AppError::ExternalService(
                    "リクエストのクローンに失敗しました".to_string(),
                ));
            };

            match cloned_request.send().await {
                Ok(response) => {
                    if !response.status().is_success() {
                        return Err(AppError::ExternalService(format!(
                            "読み取りAPIエラー: status={}",
                            response.status()
                        )));
                    }

                    return response.json::<ExtractionResponse>().await.map_err(|e| {
                        AppError::ExternalService(format!("レスポンス解析エラー: {e}"))
                    });
                }
                Err(e) => {
                    if attempts < config.max_retries {
                        attempts += 1;
                        let delay = Duration::from_secs(2_u64.pow(attempts));
                        log::warn!(
                            "読み取りAPIリクエスト失敗、リトライします: attempt={attempts}/{}, delay={delay:?}",
                            config.max_retries
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(AppError::ExternalService(format!(
                        "読み取りAPIへの接続に失敗しました: {e}"
                    )));
                }
            }
        }
    }
}
