//! Pure normalization of upstream order records into outbound envelopes.
//!
//! The mapper performs no I/O: the worker prefetches every dependency into
//! an [`OrderBatch`] and the mapper only assembles. Monetary values and
//! quantities pass through verbatim as the upstream reported them.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::upstream::record::Record;
use crate::upstream::WRITE_DATE_FORMAT;

/// Platform tag stamped into every envelope source block.
pub const PLATFORM: &str = "UPSTREAM";

/// Event name carried by every envelope.
pub const EVENT_ORDER_CONFIRMED: &str = "order.confirmed";

/// Data defects that make an order unmappable. The worker skips such orders
/// and counts them failed without queueing a retry.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("order record is missing required field `{0}`")]
    MissingField(&'static str),
}

/// Identity of the connection an envelope is produced for.
#[derive(Debug, Clone)]
pub struct MapContext<'a> {
    pub connection_id: Uuid,
    pub upstream_db: &'a str,
    pub store_id: &'a str,
    pub client_id: &'a str,
}

/// Dependencies prefetched by the worker for one dispatch loop, indexed by
/// upstream id. Lines are indexed by their parent order.
#[derive(Debug, Default)]
pub struct OrderBatch {
    pub partners: HashMap<i64, Record>,
    pub lines_by_order: HashMap<i64, Vec<Record>>,
    pub products: HashMap<i64, Record>,
    pub templates: HashMap<i64, Record>,
    pub attribute_values: HashMap<i64, Record>,
}

/// Normalized outbound payload; field order mirrors the wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub external_id: String,
    pub source: Source,
    pub order: OrderBody,
    pub customer: Customer,
    pub shipping_address: ShippingAddress,
    pub items: Vec<EnvelopeItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub platform: String,
    pub connection_id: String,
    pub store_id: String,
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBody {
    pub platform_order_id: String,
    pub platform_order_number: String,
    pub date_order: Option<String>,
    pub financial_status: String,
    pub note: Option<String>,
    pub client_order_ref: Option<String>,
    pub amount_total: Value,
    pub tags: Vec<String>,
    pub platform_attributes: PlatformAttributes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformAttributes {
    pub upstream_state: String,
    pub client_order_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub orders_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub name: String,
    pub address1: String,
    pub address2: String,
    pub city: String,
    pub province: String,
    pub zip: String,
    pub country: String,
    pub phone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeItem {
    pub sku: String,
    pub name: String,
    pub variant_name: String,
    pub quantity: Number,
    pub price_cents: Value,
}

/// Stable downstream idempotency key for an order.
pub fn external_id(upstream_db: &str, order_id: i64) -> String {
    format!("upstream_{upstream_db}_{order_id}")
}

/// Maps one order record plus its prefetched dependencies into the outbound
/// envelope.
pub fn map_order(
    order: &Record,
    batch: &OrderBatch,
    ctx: &MapContext<'_>,
) -> Result<Envelope, MapError> {
    let order_id = order.id().ok_or(MapError::MissingField("id"))?;
    let order_number = order
        .text("name")
        .ok_or(MapError::MissingField("name"))?
        .to_string();

    let customer_record = order
        .many2one("partner_id")
        .and_then(|r| batch.partners.get(&r.id));
    let shipping_record = order
        .many2one("partner_shipping_id")
        .and_then(|r| batch.partners.get(&r.id))
        .or(customer_record);

    let items = batch
        .lines_by_order
        .get(&order_id)
        .map(|lines| map_lines(lines, batch, ctx.upstream_db))
        .unwrap_or_default();

    let client_order_ref = order.text("client_order_ref").map(str::to_string);

    Ok(Envelope {
        event: EVENT_ORDER_CONFIRMED.to_string(),
        external_id: external_id(ctx.upstream_db, order_id),
        source: Source {
            platform: PLATFORM.to_string(),
            connection_id: ctx.connection_id.to_string(),
            store_id: ctx.store_id.to_string(),
            client_id: ctx.client_id.to_string(),
        },
        order: OrderBody {
            platform_order_id: order_id.to_string(),
            platform_order_number: order_number,
            date_order: order.text("date_order").and_then(normalize_datetime),
            financial_status: "paid".to_string(),
            note: order.text("note").map(str::to_string),
            client_order_ref: client_order_ref.clone(),
            amount_total: order
                .number("amount_total")
                .map(Value::Number)
                .unwrap_or_else(|| Value::from(0)),
            tags: Vec::new(),
            platform_attributes: PlatformAttributes {
                upstream_state: order.text_or_empty("state"),
                client_order_ref,
            },
        },
        customer: map_customer(customer_record),
        shipping_address: map_shipping_address(shipping_record),
        items,
    })
}

fn map_customer(partner: Option<&Record>) -> Customer {
    match partner {
        Some(partner) => Customer {
            name: partner.text("name").map(str::to_string),
            phone: preferred_phone(partner),
            email: partner.text("email").map(str::to_string),
            orders_count: partner
                .number("sale_order_count")
                .and_then(|n| n.as_i64())
                .unwrap_or(0),
        },
        None => Customer {
            name: None,
            phone: None,
            email: None,
            orders_count: 0,
        },
    }
}

fn map_shipping_address(partner: Option<&Record>) -> ShippingAddress {
    let Some(partner) = partner else {
        return ShippingAddress {
            name: String::new(),
            address1: String::new(),
            address2: String::new(),
            city: String::new(),
            province: String::new(),
            zip: String::new(),
            country: String::new(),
            phone: String::new(),
        };
    };

    ShippingAddress {
        name: partner.text_or_empty("name"),
        address1: partner.text_or_empty("street"),
        address2: partner.text_or_empty("street2"),
        city: partner.text_or_empty("city"),
        province: partner
            .many2one("state_id")
            .map(|s| s.label)
            .unwrap_or_default(),
        zip: partner.text_or_empty("zip"),
        country: partner.text_or_empty("country_code"),
        phone: preferred_phone(partner).unwrap_or_default(),
    }
}

/// Contact preference: mobile when present, else landline.
fn preferred_phone(partner: &Record) -> Option<String> {
    partner
        .text("mobile")
        .or_else(|| partner.text("phone"))
        .map(str::to_string)
}

fn map_lines(lines: &[Record], batch: &OrderBatch, upstream_db: &str) -> Vec<EnvelopeItem> {
    lines
        .iter()
        .filter_map(|line| map_line(line, batch, upstream_db))
        .collect()
}

fn map_line(line: &Record, batch: &OrderBatch, upstream_db: &str) -> Option<EnvelopeItem> {
    let quantity = line.number("product_uom_qty").unwrap_or_else(|| 0.into());
    if quantity.as_f64().unwrap_or(0.0) <= 0.0 {
        return None;
    }

    let product_id = line.many2one("product_id").map(|p| p.id);
    let product = product_id.and_then(|id| batch.products.get(&id));
    let template = product
        .and_then(|p| p.many2one("product_tmpl_id"))
        .and_then(|t| batch.templates.get(&t.id));

    Some(EnvelopeItem {
        sku: resolve_sku(product, template, upstream_db, product_id.unwrap_or(0)),
        name: line.text_or_empty("name"),
        variant_name: variant_label(product, batch),
        quantity: normalize_quantity(quantity),
        price_cents: line
            .number("price_unit")
            .map(Value::Number)
            .unwrap_or_else(|| Value::from(0)),
    })
}

/// SKU fallback chain: primary code, barcode, parent template code, then a
/// synthesized stable identifier.
fn resolve_sku(
    product: Option<&Record>,
    template: Option<&Record>,
    upstream_db: &str,
    product_id: i64,
) -> String {
    if let Some(code) = product.and_then(|p| p.text("default_code")) {
        return code.to_string();
    }
    if let Some(barcode) = product.and_then(|p| p.text("barcode")) {
        return barcode.to_string();
    }
    if let Some(code) = template.and_then(|t| t.text("default_code")) {
        return code.to_string();
    }
    format!("UPSTREAM-{upstream_db}-{product_id}")
}

/// Attribute value names joined in upstream-declared order.
fn variant_label(product: Option<&Record>, batch: &OrderBatch) -> String {
    let Some(product) = product else {
        return String::new();
    };

    product
        .id_list("product_template_attribute_value_ids")
        .iter()
        .filter_map(|id| batch.attribute_values.get(id))
        .filter_map(|value| value.text("name"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Quantities keep the upstream representation, except that whole-valued
/// floats collapse to integers so downstream integer parsers stay happy.
fn normalize_quantity(quantity: Number) -> Number {
    if quantity.is_i64() || quantity.is_u64() {
        return quantity;
    }
    match quantity.as_f64() {
        Some(value) if value.fract() == 0.0 && value.abs() < i64::MAX as f64 => {
            Number::from(value as i64)
        }
        _ => quantity,
    }
}

/// Upstream timestamps arrive as `YYYY-MM-DD HH:MM:SS`; outbound dates are
/// ISO-8601 with a `Z` suffix.
fn normalize_datetime(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }

    let parsed = NaiveDateTime::parse_from_str(raw, WRITE_DATE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()?;

    Some(format!("{}Z", parsed.format("%Y-%m-%dT%H:%M:%S")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        Record::from_value(value).expect("object")
    }

    fn ctx(connection_id: Uuid) -> MapContext<'static> {
        MapContext {
            connection_id,
            upstream_db: "acme-prod",
            store_id: "store-9",
            client_id: "client-4",
        }
    }

    fn sample_order() -> Record {
        record(json!({
            "id": 42,
            "name": "S00042",
            "state": "sale",
            "date_order": "2025-01-15 10:30:00",
            "write_date": "2025-01-15 10:31:00",
            "partner_id": [5, "Jane Fonda"],
            "partner_shipping_id": [6, "Jane Fonda (delivery)"],
            "amount_total": 129.5,
            "note": "leave at the door",
            "client_order_ref": "PO-881",
        }))
    }

    fn sample_batch() -> OrderBatch {
        let mut batch = OrderBatch::default();
        batch.partners.insert(
            5,
            record(json!({
                "id": 5,
                "name": "Jane Fonda",
                "email": "jane@example.com",
                "phone": "+1 555 0100",
                "mobile": "+1 555 0199",
                "sale_order_count": 7,
            })),
        );
        batch.partners.insert(
            6,
            record(json!({
                "id": 6,
                "name": "Jane Fonda (delivery)",
                "street": "1 Main St",
                "street2": false,
                "city": "Springfield",
                "state_id": [31, "Illinois"],
                "zip": "62701",
                "country_id": [233, "United States"],
                "country_code": "US",
                "phone": "+1 555 0100",
                "mobile": false,
            })),
        );
        batch.lines_by_order.insert(
            42,
            vec![
                record(json!({
                    "id": 900,
                    "order_id": [42, "S00042"],
                    "product_id": [77, "Shirt (L, Blue)"],
                    "name": "Shirt (L, Blue)",
                    "product_uom_qty": 2.0,
                    "price_unit": 19.99,
                })),
                record(json!({
                    "id": 901,
                    "order_id": [42, "S00042"],
                    "product_id": [78, "Gift note"],
                    "name": "Gift note",
                    "product_uom_qty": 0,
                    "price_unit": 0,
                })),
            ],
        );
        batch.products.insert(
            77,
            record(json!({
                "id": 77,
                "name": "Shirt",
                "default_code": "SHIRT-L-BLUE",
                "barcode": "761234",
                "product_tmpl_id": [12, "Shirt"],
                "product_template_attribute_value_ids": [201, 202],
            })),
        );
        batch.templates.insert(
            12,
            record(json!({"id": 12, "name": "Shirt", "default_code": "SHIRT"})),
        );
        batch
            .attribute_values
            .insert(201, record(json!({"id": 201, "name": "L"})));
        batch
            .attribute_values
            .insert(202, record(json!({"id": 202, "name": "Blue"})));
        batch
    }

    #[test]
    fn maps_full_envelope() {
        let connection_id = Uuid::new_v4();
        let envelope =
            map_order(&sample_order(), &sample_batch(), &ctx(connection_id)).expect("maps");

        assert_eq!(envelope.event, "order.confirmed");
        assert_eq!(envelope.external_id, "upstream_acme-prod_42");
        assert_eq!(envelope.source.platform, "UPSTREAM");
        assert_eq!(envelope.source.connection_id, connection_id.to_string());
        assert_eq!(envelope.source.store_id, "store-9");
        assert_eq!(envelope.source.client_id, "client-4");

        assert_eq!(envelope.order.platform_order_id, "42");
        assert_eq!(envelope.order.platform_order_number, "S00042");
        assert_eq!(
            envelope.order.date_order.as_deref(),
            Some("2025-01-15T10:30:00Z")
        );
        assert_eq!(envelope.order.financial_status, "paid");
        assert_eq!(envelope.order.amount_total, json!(129.5));
        assert!(envelope.order.tags.is_empty());
        assert_eq!(envelope.order.platform_attributes.upstream_state, "sale");
        assert_eq!(
            envelope.order.platform_attributes.client_order_ref.as_deref(),
            Some("PO-881")
        );

        assert_eq!(envelope.customer.name.as_deref(), Some("Jane Fonda"));
        assert_eq!(envelope.customer.orders_count, 7);

        assert_eq!(envelope.shipping_address.address1, "1 Main St");
        assert_eq!(envelope.shipping_address.address2, "");
        assert_eq!(envelope.shipping_address.province, "Illinois");
        assert_eq!(envelope.shipping_address.country, "US");
    }

    #[test]
    fn customer_phone_prefers_mobile() {
        let envelope =
            map_order(&sample_order(), &sample_batch(), &ctx(Uuid::new_v4())).expect("maps");
        assert_eq!(envelope.customer.phone.as_deref(), Some("+1 555 0199"));
        // The delivery partner has no mobile, so the landline wins there.
        assert_eq!(envelope.shipping_address.phone, "+1 555 0100");
    }

    #[test]
    fn zero_quantity_lines_are_dropped() {
        let envelope =
            map_order(&sample_order(), &sample_batch(), &ctx(Uuid::new_v4())).expect("maps");
        assert_eq!(envelope.items.len(), 1);
        assert_eq!(envelope.items[0].sku, "SHIRT-L-BLUE");
    }

    #[test]
    fn whole_float_quantity_collapses_to_integer() {
        let envelope =
            map_order(&sample_order(), &sample_batch(), &ctx(Uuid::new_v4())).expect("maps");
        assert_eq!(envelope.items[0].quantity, Number::from(2));

        let fractional = normalize_quantity(Number::from_f64(2.5).expect("number"));
        assert_eq!(fractional.as_f64(), Some(2.5));
    }

    #[test]
    fn unit_price_passes_through_verbatim() {
        let envelope =
            map_order(&sample_order(), &sample_batch(), &ctx(Uuid::new_v4())).expect("maps");
        assert_eq!(envelope.items[0].price_cents, json!(19.99));
    }

    #[test]
    fn variant_label_joins_in_declared_order() {
        let envelope =
            map_order(&sample_order(), &sample_batch(), &ctx(Uuid::new_v4())).expect("maps");
        assert_eq!(envelope.items[0].variant_name, "L, Blue");
    }

    #[test]
    fn sku_falls_back_through_the_chain() {
        let template = record(json!({"id": 12, "default_code": "TMPL-CODE"}));

        let with_code = record(json!({"id": 1, "default_code": "CODE", "barcode": "999"}));
        assert_eq!(resolve_sku(Some(&with_code), None, "db", 1), "CODE");

        let with_barcode = record(json!({"id": 1, "default_code": false, "barcode": "999"}));
        assert_eq!(resolve_sku(Some(&with_barcode), None, "db", 1), "999");

        let bare = record(json!({"id": 1, "default_code": false, "barcode": false}));
        assert_eq!(
            resolve_sku(Some(&bare), Some(&template), "db", 1),
            "TMPL-CODE"
        );
        assert_eq!(resolve_sku(Some(&bare), None, "acme", 7), "UPSTREAM-acme-7");
        assert_eq!(resolve_sku(None, None, "acme", 0), "UPSTREAM-acme-0");
    }

    #[test]
    fn missing_partner_yields_empty_blocks() {
        let order = record(json!({"id": 50, "name": "S00050", "state": "done"}));
        let envelope = map_order(&order, &OrderBatch::default(), &ctx(Uuid::new_v4())).expect("maps");

        assert_eq!(envelope.customer.name, None);
        assert_eq!(envelope.customer.orders_count, 0);
        assert_eq!(envelope.shipping_address.country, "");
        assert!(envelope.items.is_empty());
        assert_eq!(envelope.order.note, None);
        assert_eq!(envelope.order.amount_total, json!(0));
    }

    #[test]
    fn missing_order_id_is_a_data_defect() {
        let order = record(json!({"name": "S00051"}));
        assert!(matches!(
            map_order(&order, &OrderBatch::default(), &ctx(Uuid::new_v4())),
            Err(MapError::MissingField("id"))
        ));

        let order = record(json!({"id": 51}));
        assert!(matches!(
            map_order(&order, &OrderBatch::default(), &ctx(Uuid::new_v4())),
            Err(MapError::MissingField("name"))
        ));
    }

    #[test]
    fn datetime_normalization() {
        assert_eq!(
            normalize_datetime("2025-01-15 10:30:00").as_deref(),
            Some("2025-01-15T10:30:00Z")
        );
        assert_eq!(
            normalize_datetime("2025-01-15T10:30:00").as_deref(),
            Some("2025-01-15T10:30:00Z")
        );
        assert_eq!(normalize_datetime(""), None);
        assert_eq!(normalize_datetime("not a date"), None);
    }

    #[test]
    fn envelope_serializes_to_wire_shape() {
        let envelope =
            map_order(&sample_order(), &sample_batch(), &ctx(Uuid::nil())).expect("maps");
        let wire = serde_json::to_value(&envelope).expect("serializes");

        assert_eq!(wire["event"], "order.confirmed");
        assert_eq!(wire["source"]["platform"], "UPSTREAM");
        assert_eq!(wire["order"]["platform_order_id"], "42");
        assert_eq!(wire["order"]["tags"], json!([]));
        assert_eq!(wire["items"][0]["quantity"], json!(2));
        assert_eq!(wire["items"][0]["price_cents"], json!(19.99));
        assert_eq!(
            wire["order"]["platform_attributes"]["upstream_state"],
            "sale"
        );
    }
}
