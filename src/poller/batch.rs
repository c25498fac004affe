//! Batch prefetch for the dispatch loop.
//!
//! Collects every dependency of the surviving candidates with one read per
//! model, so the mapper never has to reach back to the upstream (and the
//! cycle never degenerates into per-order N+1 calls).

use std::collections::BTreeSet;

use serde_json::json;

use crate::mapper::OrderBatch;
use crate::upstream::{Record, UpstreamClient, UpstreamError};

pub const ORDER_MODEL: &str = "sale.order";
pub const LINE_MODEL: &str = "sale.order.line";
pub const PARTNER_MODEL: &str = "res.partner";
pub const PRODUCT_MODEL: &str = "product.product";
pub const TEMPLATE_MODEL: &str = "product.template";
pub const ATTRIBUTE_VALUE_MODEL: &str = "product.template.attribute.value";

/// Fields fetched for every candidate order.
pub const ORDER_FIELDS: [&str; 9] = [
    "name",
    "state",
    "date_order",
    "write_date",
    "partner_id",
    "partner_shipping_id",
    "amount_total",
    "note",
    "client_order_ref",
];

const LINE_FIELDS: [&str; 5] = ["order_id", "product_id", "name", "product_uom_qty", "price_unit"];

const PARTNER_FIELDS: [&str; 13] = [
    "name",
    "email",
    "phone",
    "mobile",
    "street",
    "street2",
    "city",
    "state_id",
    "zip",
    "country_id",
    "country_code",
    "vat",
    "sale_order_count",
];

const PRODUCT_FIELDS: [&str; 5] = [
    "name",
    "default_code",
    "barcode",
    "product_tmpl_id",
    "product_template_attribute_value_ids",
];

const TEMPLATE_FIELDS: [&str; 2] = ["name", "default_code"];

const ATTRIBUTE_VALUE_FIELDS: [&str; 1] = ["name"];

/// Prefetches lines, partners, products, templates and attribute values for
/// the given orders into per-id maps.
pub async fn fetch_order_batch(
    client: &mut UpstreamClient,
    orders: &[&Record],
) -> Result<OrderBatch, UpstreamError> {
    let mut batch = OrderBatch::default();

    let mut partner_ids: BTreeSet<i64> = BTreeSet::new();
    for order in orders {
        if let Some(partner) = order.many2one("partner_id") {
            partner_ids.insert(partner.id);
        }
        if let Some(shipping) = order.many2one("partner_shipping_id") {
            partner_ids.insert(shipping.id);
        }
    }

    let order_ids: Vec<i64> = orders.iter().filter_map(|o| o.id()).collect();
    let lines = if order_ids.is_empty() {
        Vec::new()
    } else {
        client
            .search_read(
                LINE_MODEL,
                json!([["order_id", "in", order_ids]]),
                &LINE_FIELDS,
                None,
                None,
            )
            .await?
    };

    let mut product_ids: BTreeSet<i64> = BTreeSet::new();
    for line in &lines {
        if let Some(product) = line.many2one("product_id") {
            product_ids.insert(product.id);
        }
    }

    if !partner_ids.is_empty() {
        let partner_ids: Vec<i64> = partner_ids.into_iter().collect();
        for partner in client
            .read(PARTNER_MODEL, &partner_ids, &PARTNER_FIELDS)
            .await?
        {
            if let Some(id) = partner.id() {
                batch.partners.insert(id, partner);
            }
        }
    }

    if !product_ids.is_empty() {
        let product_ids: Vec<i64> = product_ids.into_iter().collect();
        let products = client
            .read(PRODUCT_MODEL, &product_ids, &PRODUCT_FIELDS)
            .await?;

        let mut template_ids: BTreeSet<i64> = BTreeSet::new();
        let mut value_ids: BTreeSet<i64> = BTreeSet::new();
        for product in &products {
            if let Some(template) = product.many2one("product_tmpl_id") {
                template_ids.insert(template.id);
            }
            value_ids.extend(product.id_list("product_template_attribute_value_ids"));
        }

        for product in products {
            if let Some(id) = product.id() {
                batch.products.insert(id, product);
            }
        }

        if !template_ids.is_empty() {
            let template_ids: Vec<i64> = template_ids.into_iter().collect();
            for template in client
                .read(TEMPLATE_MODEL, &template_ids, &TEMPLATE_FIELDS)
                .await?
            {
                if let Some(id) = template.id() {
                    batch.templates.insert(id, template);
                }
            }
        }

        if !value_ids.is_empty() {
            let value_ids: Vec<i64> = value_ids.into_iter().collect();
            for value in client
                .read(ATTRIBUTE_VALUE_MODEL, &value_ids, &ATTRIBUTE_VALUE_FIELDS)
                .await?
            {
                if let Some(id) = value.id() {
                    batch.attribute_values.insert(id, value);
                }
            }
        }
    }

    for line in lines {
        if let Some(order) = line.many2one("order_id") {
            batch.lines_by_order.entry(order.id).or_default().push(line);
        }
    }

    Ok(batch)
}
