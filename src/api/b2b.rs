use super::common::{
    self, amount, authorize_business, dispatch_response, parse_object, respond, text,
    BusinessQuery,
};
use super::AppState;
use crate::error::AppError;
use crate::ledger::{LedgerKind, NewLedgerRow};
use crate::payments::requests::whole_amount;
use crate::payments::types::{DarajaEndpoint, ShortcodeType};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Response,
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

pub const WRITE_SCOPE: &str = "b2b:write";
pub const READ_SCOPE: &str = "b2b:read";

const DEFAULT_PARTNER_NAME: &str = "Vendor";

/// POST /api/v1/b2b/ussd/push
///
/// Prompts the merchant behind `primary_short_code` to pay the business's B2B
/// shortcode. The receiver defaults to the business's active B2B shortcode.
pub async fn initiate_ussd_push(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    respond(&headers, ussd_push(&state, &headers, &body).await)
}

async fn ussd_push(state: &AppState, headers: &HeaderMap, body: &str) -> Result<Response, AppError> {
    let body = parse_object(body)?;
    let explicit = text(&body, &["business_id"]);
    let (_, business) = authorize_business(state, headers, WRITE_SCOPE, explicit.as_deref()).await?;

    let environment = common::environment(&body)?;
    let primary_short_code =
        common::required_text(&body, &["primary_short_code", "primaryShortCode"])?;
    let amount = amount(&body, &["amount"])?;
    let payment_ref = text(&body, &["payment_ref", "paymentRef"])
        .unwrap_or_else(|| "paymentRef".to_string());
    let partner_name = text(&body, &["partner_name", "partnerName"])
        .unwrap_or_else(|| DEFAULT_PARTNER_NAME.to_string());
    let request_ref_id = text(&body, &["request_ref_id", "RequestRefID"])
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let receiver_short_code = match text(&body, &["receiver_short_code", "receiverShortCode"]) {
        Some(code) => Some(code),
        None => common::active_shortcode(state, &business, &[ShortcodeType::B2b])
            .await?
            .map(|s| s.shortcode),
    };

    let mut new = NewLedgerRow::new(LedgerKind::B2bUssd, Some(business.id), environment);
    new.amount = Some(amount.clone());
    new.account_reference = Some(payment_ref.clone());
    new.correlation.request_ref_id = Some(request_ref_id.clone());

    info!(
        business_id = %business.id,
        environment = %environment,
        ledger_id = %new.id,
        request_ref_id = %request_ref_id,
        "initiating B2B USSD push"
    );

    let payload = json!({
        "primaryShortCode": primary_short_code,
        "receiverShortCode": receiver_short_code,
        "amount": whole_amount(&amount),
        "paymentRef": payment_ref,
        "callbackUrl": state.callback_urls.b2b_ussd(),
        "partnerName": partner_name,
        "RequestRefID": request_ref_id,
    });

    let outcome = if receiver_short_code.is_some() {
        state
            .dispatcher
            .dispatch(new, DarajaEndpoint::B2bUssdPush, payload)
            .await?
    } else {
        state.dispatcher.missing_credentials(new, payload).await?
    };

    Ok(dispatch_response(outcome, "ussd_request"))
}

/// GET /api/v1/b2b/ussd/{id}
pub async fn get_ussd_push(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<BusinessQuery>,
) -> Response {
    let result = common::read_row(
        &state,
        &headers,
        READ_SCOPE,
        LedgerKind::B2bUssd,
        &id,
        query.business_id.as_deref(),
        "ussd_request",
    )
    .await;
    respond(&headers, result)
}
