use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub group_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Grade,
    Homework,
    Attendance,
    ManualAdjustment,
    Redemption,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Grade => "grade",
            Self::Homework => "homework",
            Self::Attendance => "attendance",
            Self::ManualAdjustment => "manual_adjustment",
            Self::Redemption => "redemption",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grade" => Some(Self::Grade),
            "homework" => Some(Self::Homework),
            "attendance" => Some(Self::Attendance),
            "manual_adjustment" => Some(Self::ManualAdjustment),
            "redemption" => Some(Self::Redemption),
            _ => None,
        }
    }
}

/// Idempotency key of an academic event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub student_id: String,
    pub kind: SourceKind,
    pub event_id: String,
}

#[derive(Debug, Clone)]
pub struct TransactionInput {
    pub student_id: String,
    pub source_kind: SourceKind,
    pub source_event_id: String,
    pub amount: i64,
    pub description: String,
    pub reverses: Option<String>,
}

impl TransactionInput {
    pub fn new(
        student_id: impl Into<String>,
        source_kind: SourceKind,
        source_event_id: impl Into<String>,
        amount: i64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            student_id: student_id.into(),
            source_kind,
            source_event_id: source_event_id.into(),
            amount,
            description: description.into(),
            reverses: None,
        }
    }

    pub fn source_key(&self) -> SourceKey {
        SourceKey {
            student_id: self.student_id.clone(),
            kind: self.source_kind,
            event_id: self.source_event_id.clone(),
        }
    }

    /// Earning transactions are the positive, non-compensating ones.
    pub fn is_earning(&self) -> bool {
        self.amount > 0 && self.reverses.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsTransaction {
    pub id: String,
    pub seq: i64,
    pub student_id: String,
    pub source_kind: SourceKind,
    pub source_event_id: String,
    pub amount: i64,
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverses: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentPointsAccount {
    pub student_id: String,
    pub total_points: i64,
    pub earned_today: i64,
    pub earned_day: Option<NaiveDate>,
}

impl StudentPointsAccount {
    pub fn empty(student_id: impl Into<String>) -> Self {
        Self {
            student_id: student_id.into(),
            total_points: 0,
            earned_today: 0,
            earned_day: None,
        }
    }

    /// Folds one appended amount into the materialized totals.
    pub fn apply(&mut self, amount: i64, today: NaiveDate) {
        self.total_points += amount;
        if amount > 0 {
            if self.earned_day == Some(today) {
                self.earned_today += amount;
            } else {
                self.earned_day = Some(today);
                self.earned_today = amount;
            }
        }
    }

    /// The account as seen on `today`: yesterday's earnings do not count.
    pub fn as_of(mut self, today: NaiveDate) -> Self {
        if self.earned_day != Some(today) {
            self.earned_today = 0;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShopCategory {
    Clothing,
    Accessories,
    Stationery,
    Electronics,
}

impl ShopCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clothing => "clothing",
            Self::Accessories => "accessories",
            Self::Stationery => "stationery",
            Self::Electronics => "electronics",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clothing" => Some(Self::Clothing),
            "accessories" => Some(Self::Accessories),
            "stationery" => Some(Self::Stationery),
            "electronics" => Some(Self::Electronics),
            _ => None,
        }
    }
}

/// `null` on the wire means unlimited; a number is a limited count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<u32>", into = "Option<u32>")]
pub enum Stock {
    Unlimited,
    Limited(u32),
}

impl Stock {
    pub fn available(self) -> bool {
        !matches!(self, Stock::Limited(0))
    }

    pub fn to_column(self) -> Option<i64> {
        match self {
            Stock::Unlimited => None,
            Stock::Limited(n) => Some(i64::from(n)),
        }
    }
}

impl From<Option<u32>> for Stock {
    fn from(v: Option<u32>) -> Self {
        match v {
            Some(n) => Stock::Limited(n),
            None => Stock::Unlimited,
        }
    }
}

impl From<Stock> for Option<u32> {
    fn from(s: Stock) -> Self {
        match s {
            Stock::Unlimited => None,
            Stock::Limited(n) => Some(n),
        }
    }
}

pub const POPULAR_THRESHOLD: u8 = 80;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShopItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub cost: i64,
    pub category: ShopCategory,
    #[serde(default = "unlimited")]
    pub stock: Stock,
    #[serde(default)]
    pub popularity: u8,
}

fn unlimited() -> Stock {
    Stock::Unlimited
}

impl ShopItem {
    pub fn in_stock(&self) -> bool {
        self.stock.available()
    }

    pub fn is_popular(&self) -> bool {
        self.popularity > POPULAR_THRESHOLD
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Pending,
    Processing,
    Completed,
    Delivered,
    Failed,
}

impl PurchaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn can_advance_to(self, next: PurchaseStatus) -> bool {
        use PurchaseStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Delivered)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    pub id: String,
    pub student_id: String,
    pub item_id: String,
    pub item_name: String,
    pub cost: i64,
    pub transaction_id: String,
    pub status: PurchaseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Window over a reverse-chronological history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub const DEFAULT_LIMIT: usize = 50;
    pub const MAX_LIMIT: usize = 500;

    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, Self::DEFAULT_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earned_today_resets_on_new_day() {
        let d1 = NaiveDate::from_ymd_opt(2026, 3, 2).expect("date");
        let d2 = NaiveDate::from_ymd_opt(2026, 3, 3).expect("date");
        let mut acct = StudentPointsAccount::empty("s1");
        acct.apply(10, d1);
        acct.apply(5, d1);
        acct.apply(-4, d1);
        assert_eq!(acct.total_points, 11);
        assert_eq!(acct.earned_today, 15);
        assert_eq!(acct.clone().as_of(d2).earned_today, 0);

        acct.apply(3, d2);
        assert_eq!(acct.earned_today, 3);
        assert_eq!(acct.total_points, 14);
    }

    #[test]
    fn stock_null_is_unlimited_and_zero_is_sold_out() {
        let unlimited: Stock = serde_json::from_str("null").expect("parse null");
        let sold_out: Stock = serde_json::from_str("0").expect("parse zero");
        assert_eq!(unlimited, Stock::Unlimited);
        assert!(unlimited.available());
        assert_eq!(sold_out, Stock::Limited(0));
        assert!(!sold_out.available());
    }

    #[test]
    fn purchase_lifecycle_never_leaves_delivered() {
        use PurchaseStatus::*;
        assert!(Completed.can_advance_to(Delivered));
        assert!(Pending.can_advance_to(Processing));
        assert!(!Delivered.can_advance_to(Completed));
        assert!(!Completed.can_advance_to(Pending));
        assert!(!Failed.can_advance_to(Processing));
    }
}
