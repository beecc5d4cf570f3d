use crate::error::{LedgerError, LedgerResult};
use crate::model::{ShopCategory, ShopItem, Stock};
use crate::store::{run, LockScope, Store, StoreTx};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub category: Option<ShopCategory>,
    pub available_only: bool,
}

impl ItemFilter {
    fn matches(&self, item: &ShopItem) -> bool {
        if let Some(c) = self.category {
            if item.category != c {
                return false;
            }
        }
        !self.available_only || item.in_stock()
    }
}

/// A tentative stock decrement made inside a unit of work. It must be
/// either committed or released before the unit finishes.
#[must_use = "reservations must be committed or released"]
#[derive(Debug)]
pub struct ReservationToken {
    item_id: String,
    before: Stock,
}

pub struct Catalog {
    store: Arc<dyn Store>,
}

impl Catalog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn list_items(&self, filter: &ItemFilter) -> LedgerResult<Vec<ShopItem>> {
        let items = run(&*self.store, &LockScope::read_only(), |tx| tx.list_items())?;
        Ok(items.into_iter().filter(|i| filter.matches(i)).collect())
    }

    pub fn item(&self, id: &str) -> LedgerResult<ShopItem> {
        run(&*self.store, &LockScope::read_only(), |tx| tx.item(id))?
            .ok_or_else(|| LedgerError::not_found("item", id))
    }

    /// Creates or replaces a catalog entry. Past purchases keep the cost
    /// they were made at.
    pub fn upsert_item(&self, item: ShopItem) -> LedgerResult<ShopItem> {
        validate_item(&item)?;
        let scope = LockScope::default().item(&item.id);
        run(&*self.store, &scope, |tx| tx.put_item(&item))?;
        tracing::info!(item_id = %item.id, cost = item.cost, "catalog item saved");
        Ok(item)
    }

    pub fn reserve_stock(tx: &mut dyn StoreTx, item_id: &str) -> LedgerResult<ReservationToken> {
        let mut item = tx
            .item(item_id)?
            .ok_or_else(|| LedgerError::not_found("item", item_id))?;
        let before = item.stock;
        match before {
            Stock::Unlimited => {}
            Stock::Limited(0) => {
                return Err(LedgerError::OutOfStock {
                    item_id: item_id.to_string(),
                })
            }
            Stock::Limited(n) => {
                item.stock = Stock::Limited(n - 1);
                tx.put_item(&item)?;
            }
        }
        Ok(ReservationToken {
            item_id: item_id.to_string(),
            before,
        })
    }

    pub fn commit_reservation(token: ReservationToken) {
        tracing::debug!(item_id = %token.item_id, "stock reservation committed");
    }

    pub fn release_reservation(tx: &mut dyn StoreTx, token: ReservationToken) -> LedgerResult<()> {
        if let Stock::Limited(_) = token.before {
            let mut item = tx
                .item(&token.item_id)?
                .ok_or_else(|| LedgerError::not_found("item", &token.item_id))?;
            item.stock = match item.stock {
                Stock::Limited(n) => Stock::Limited(n + 1),
                Stock::Unlimited => Stock::Unlimited,
            };
            tx.put_item(&item)?;
        }
        tracing::debug!(item_id = %token.item_id, "stock reservation released");
        Ok(())
    }
}

fn validate_item(item: &ShopItem) -> LedgerResult<()> {
    if item.id.trim().is_empty() {
        return Err(LedgerError::InvalidInput("item id must not be empty".into()));
    }
    if item.name.trim().is_empty() {
        return Err(LedgerError::InvalidInput("item name must not be empty".into()));
    }
    if item.cost <= 0 {
        return Err(LedgerError::InvalidInput("cost must be positive".into()));
    }
    if item.popularity > 100 {
        return Err(LedgerError::InvalidInput(
            "popularity must be in 0..=100".into(),
        ));
    }
    Ok(())
}
