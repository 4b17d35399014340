//! Ratiba standing orders
//!
//! The integrator sends a Daraja standing-order body. The gateway fills in the
//! callback URL (carrying the new row id as `order_id`) and, when missing, the
//! business shortcode and the fields derived from its type.

use super::common::{
    self, authorize_business, dispatch_response, invalid_payload, parse_object, respond, text,
    BusinessQuery, HistoryQuery, JsonObject,
};
use super::AppState;
use crate::error::AppError;
use crate::ledger::{LedgerKind, NewLedgerRow};
use crate::payments::types::{DarajaEndpoint, ShortcodeType};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Response,
};
use bigdecimal::BigDecimal;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::info;

pub const WRITE_SCOPE: &str = "ratiba:write";
pub const READ_SCOPE: &str = "ratiba:read";

const REQUIRED_FIELDS: [&str; 12] = [
    "StandingOrderName",
    "StartDate",
    "EndDate",
    "BusinessShortCode",
    "TransactionType",
    "ReceiverPartyIdentifierType",
    "Amount",
    "PartyA",
    "CallBackURL",
    "AccountReference",
    "TransactionDesc",
    "Frequency",
];

fn date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d{8}$").unwrap_or_else(|_| unreachable!()))
}

fn is_numeric(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
}

/// Reject standing orders Daraja would refuse anyway
pub fn validate_standing_order(order: &JsonObject) -> Result<(), String> {
    let field = |name: &str| text(order, &[name]).unwrap_or_default();

    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|name| field(name).is_empty())
        .collect();
    if !missing.is_empty() {
        return Err(format!("Missing required field(s): {}", missing.join(", ")));
    }

    if !date_pattern().is_match(&field("StartDate")) {
        return Err("StartDate must be in YYYYMMDD format".to_string());
    }
    if !date_pattern().is_match(&field("EndDate")) {
        return Err("EndDate must be in YYYYMMDD format".to_string());
    }
    if !is_numeric(&field("BusinessShortCode")) {
        return Err("BusinessShortCode must be numeric".to_string());
    }

    let amount =
        BigDecimal::from_str(&field("Amount")).map_err(|_| "Amount must be numeric".to_string())?;
    if amount <= BigDecimal::from(0) {
        return Err("Amount must be greater than 0".to_string());
    }

    let party_a = field("PartyA");
    if !is_numeric(&party_a) || party_a.len() < 10 {
        return Err("PartyA must be a numeric MSISDN (e.g. 2547XXXXXXXX)".to_string());
    }

    let callback_url = field("CallBackURL");
    if !(callback_url.starts_with("https://") || callback_url.starts_with("http://")) {
        return Err("CallBackURL must be a valid URL".to_string());
    }
    if !is_numeric(&field("ReceiverPartyIdentifierType")) {
        return Err("ReceiverPartyIdentifierType must be numeric".to_string());
    }
    if !is_numeric(&field("Frequency")) {
        return Err("Frequency must be numeric".to_string());
    }

    Ok(())
}

fn set_default(order: &mut JsonObject, key: &str, value: &str) {
    if text(order, &[key]).is_none() {
        order.insert(key.to_string(), JsonValue::String(value.to_string()));
    }
}

/// POST /api/v1/ratiba/orders
pub async fn create_standing_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    respond(&headers, standing_order(&state, &headers, &body).await)
}

async fn standing_order(
    state: &AppState,
    headers: &HeaderMap,
    body: &str,
) -> Result<Response, AppError> {
    let mut order = parse_object(body)?;
    if order.is_empty() {
        return Err(invalid_payload("Request body must be a non-empty JSON object"));
    }
    let explicit = text(&order, &["business_id"]);
    let (_, business) = authorize_business(state, headers, WRITE_SCOPE, explicit.as_deref()).await?;
    let environment = common::environment(&order)?;
    order.remove("business_id");
    order.remove("environment");

    let mut new = NewLedgerRow::new(LedgerKind::RatibaOrder, Some(business.id), environment);
    order.insert(
        "CallBackURL".to_string(),
        JsonValue::String(state.callback_urls.ratiba(new.id)),
    );

    let shortcode = if text(&order, &["BusinessShortCode"]).is_some() {
        None
    } else {
        common::active_shortcode(
            state,
            &business,
            &[ShortcodeType::Paybill, ShortcodeType::Till],
        )
        .await?
    };
    let shortcode_missing = text(&order, &["BusinessShortCode"]).is_none() && shortcode.is_none();
    if let Some(shortcode) = &shortcode {
        set_default(&mut order, "BusinessShortCode", &shortcode.shortcode);
        let (transaction_type, identifier_type) = match shortcode.shortcode_type {
            ShortcodeType::Till => ("Standing Order Customer Pay Marchant", "2"),
            _ => ("Standing Order Customer Pay Bill", "4"),
        };
        set_default(&mut order, "TransactionType", transaction_type);
        set_default(&mut order, "ReceiverPartyIdentifierType", identifier_type);
    }

    if !shortcode_missing {
        validate_standing_order(&order).map_err(invalid_payload)?;
    }

    new.account_reference = text(&order, &["AccountReference"]);
    new.phone_number = text(&order, &["PartyA"]);
    new.amount = text(&order, &["Amount"]).and_then(|a| BigDecimal::from_str(&a).ok());

    info!(
        business_id = %business.id,
        environment = %environment,
        ledger_id = %new.id,
        account_reference = ?new.account_reference,
        "creating Ratiba standing order"
    );

    let payload = JsonValue::Object(order);
    let outcome = if shortcode_missing {
        state.dispatcher.missing_credentials(new, payload).await?
    } else {
        state
            .dispatcher
            .dispatch(new, DarajaEndpoint::RatibaStandingOrder, payload)
            .await?
    };

    Ok(dispatch_response(outcome, "ratiba_order"))
}

/// GET /api/v1/ratiba/history
pub async fn ratiba_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let result =
        common::list_rows(&state, &headers, READ_SCOPE, LedgerKind::RatibaOrder, &query).await;
    respond(&headers, result)
}

/// GET /api/v1/ratiba/orders/{id}
pub async fn get_standing_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<BusinessQuery>,
) -> Response {
    let result = common::read_row(
        &state,
        &headers,
        READ_SCOPE,
        LedgerKind::RatibaOrder,
        &id,
        query.business_id.as_deref(),
        "ratiba_order",
    )
    .await;
    respond(&headers, result)
}
