use serde::{Deserialize, Serialize};

pub type ItemId = String;

/// One active sell order on a specific world.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub price_per_unit: u64,
    // World scoped queries omit the world name from their listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_name: Option<String>,
}

/// Market state of a single item within one partition. Always replaced whole.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRecord {
    pub id: ItemId,
    #[serde(default)]
    pub listings: Vec<Listing>,
    #[serde(default)]
    pub average_price: f64,
    #[serde(default)]
    pub units_sold: u64,
}

/// A named partition belonging to a region, e.g. the `Aether` data center in `NA`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RegionPartitionTarget {
    pub region_name: String,
    pub partition_query_name: String,
}

impl RegionPartitionTarget {
    pub fn new<R, P>(region_name: R, partition_query_name: P) -> Self
    where
        R: Into<String>,
        P: Into<String>,
    {
        RegionPartitionTarget {
            region_name: region_name.into(),
            partition_query_name: partition_query_name.into(),
        }
    }
}

/// A bounded, ordered slice of the item catalog.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    /// Position of this batch within the catalog, starting at 0.
    pub index: usize,
    pub ids: Vec<ItemId>,
}

impl Batch {
    pub fn first_id(&self) -> Option<&str> {
        self.ids.first().map(String::as_str)
    }

    pub fn last_id(&self) -> Option<&str> {
        self.ids.last().map(String::as_str)
    }
}
