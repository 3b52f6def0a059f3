//! Slices a combined multi-item market response into per-item records.
//!
//! The market API answers a multi-item query with a single object: an `items` map keyed
//! by the requested ids (in request order), followed by one resolving field naming the
//! partition the response belongs to (`dcName` for data center queries, `worldName` for
//! world queries). Instead of decoding the whole document, each item's sub-object is
//! located by scanning for its quoted key, rebuilt into a standalone object carrying an
//! explicit `id`, and decoded on its own. A malformed item only costs that item.
//!
//! All offsets are byte offsets into the response body. Ids are assumed to be API
//! identifiers that never appear as object keys outside of the `items` map.

use crate::types::{ItemId, ItemRecord};

/// Candidate resolving fields, in order of preference.
const PARTITION_FIELDS: [&str; 2] = ["dcName", "worldName"];

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("response has neither a dcName nor a worldName field")]
    NoPartitionField,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("malformed item {id}: {reason}")]
    MalformedItem { id: ItemId, reason: String },
}

/// Records extracted from one partition's response.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionResult {
    /// The data center or world name resolved from the response.
    pub partition_name: String,
    pub records: Vec<ItemRecord>,
    pub requested_ids: Vec<ItemId>,
    /// Items that were present but could not be decoded. Always `MalformedItem`.
    pub item_errors: Vec<ExtractionError>,
}

impl PartitionResult {
    /// Requested ids for which the response carried no market data.
    pub fn missing_ids(&self) -> Vec<&str> {
        let failed: Vec<&str> = self
            .item_errors
            .iter()
            .filter_map(|err| match err {
                ExtractionError::MalformedItem { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();

        self.requested_ids
            .iter()
            .map(String::as_str)
            .filter(|id| {
                !failed.contains(id) && !self.records.iter().any(|record| record.id == *id)
            })
            .collect()
    }
}

/// Position of an item key within the items buffer.
#[derive(Debug, Clone, Copy)]
struct KeyMatch {
    /// Offset of the key's opening quote.
    start: usize,
    /// Offset just past the `:` that follows the key.
    value_start: usize,
}

/// Splits `raw` into one `ItemRecord` per requested id present in the response.
///
/// Ids missing from the response are dropped silently; the API omits items without
/// market activity. Items that are present but fail to decode are reported through
/// `PartitionResult::item_errors` and do not affect their neighbours.
pub fn extract(raw: &[u8], requested_ids: &[ItemId]) -> Result<PartitionResult, ExtractionError> {
    let body = std::str::from_utf8(raw)
        .map_err(|e| ExtractionError::Malformed(format!("response is not valid UTF-8: {e}")))?;

    let (partition_name, field_start) = resolve_partition(body)?;
    let items = items_section(body, field_start)?;

    let mut records = Vec::new();
    let mut item_errors = Vec::new();

    let mut idx = 0;
    // Set when the previous iteration already located the next present id.
    let mut carried: Option<KeyMatch> = None;

    // Until the first present id is found every lookup scans from the start; after that
    // the next key is always carried over or the loop ends.
    while idx < requested_ids.len() {
        let current = match carried.take() {
            Some(found) => found,
            None => match locate_key(items, &requested_ids[idx], 0) {
                Some(found) => found,
                None => {
                    idx += 1;
                    continue;
                }
            },
        };

        let next = requested_ids[idx + 1..]
            .iter()
            .enumerate()
            .find_map(|(offset, id)| {
                locate_key(items, id, current.value_start).map(|found| (idx + 1 + offset, found))
            });
        let end = next.map_or(items.len(), |(_, found)| found.start);

        let id = &requested_ids[idx];
        match decode_item(id, &items[current.value_start..end]) {
            Ok(record) => records.push(record),
            Err(reason) => item_errors.push(ExtractionError::MalformedItem {
                id: id.clone(),
                reason,
            }),
        }

        match next {
            Some((next_idx, found)) => {
                idx = next_idx;
                carried = Some(found);
            }
            // Nothing requested after this item is present in the response.
            None => break,
        }
    }

    Ok(PartitionResult {
        partition_name,
        records,
        requested_ids: requested_ids.to_vec(),
        item_errors,
    })
}

/// Finds the first resolving field and returns its value with the offset of its key.
fn resolve_partition(body: &str) -> Result<(String, usize), ExtractionError> {
    for field in PARTITION_FIELDS {
        let key = format!("\"{field}\"");
        let Some(key_start) = body.find(&key) else {
            continue;
        };

        let value = quoted_value(&body[key_start + key.len()..]).ok_or_else(|| {
            ExtractionError::Malformed(format!("{field} is not followed by a string value"))
        })?;

        if value.is_empty() {
            return Err(ExtractionError::Malformed(format!("{field} is empty")));
        }

        return Ok((value.to_string(), key_start));
    }

    Err(ExtractionError::NoPartitionField)
}

/// Parses `: "value"` at the start of `rest`.
fn quoted_value(rest: &str) -> Option<&str> {
    let rest = rest
        .trim_start()
        .strip_prefix(':')?
        .trim_start()
        .strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// Everything before the resolving field, minus the separator that precedes it.
/// The result must end with the closing brace of the items map.
fn items_section(body: &str, field_start: usize) -> Result<&str, ExtractionError> {
    let head = body[..field_start].trim_end();
    let head = head.strip_suffix(',').unwrap_or(head).trim_end();

    if !head.ends_with('}') {
        return Err(ExtractionError::Malformed(
            "no items precede the partition field".to_string(),
        ));
    }

    Ok(head)
}

/// Finds `"id"` used as an object key at or after `from`.
fn locate_key(buf: &str, id: &str, from: usize) -> Option<KeyMatch> {
    let needle = format!("\"{id}\"");
    let mut search_from = from;

    while let Some(offset) = buf.get(search_from..)?.find(&needle) {
        let start = search_from + offset;
        let after = start + needle.len();

        if let Some(value) = buf[after..].trim_start().strip_prefix(':') {
            return Some(KeyMatch {
                start,
                value_start: buf.len() - value.len(),
            });
        }

        search_from = after;
    }

    None
}

/// Rebuilds the raw fragment of one item as a standalone object and decodes it.
///
/// `fragment` spans from just after the item's key to the next present key (or the end
/// of the items section), so it ends with either the `,` separating map entries or the
/// `}` closing the items map.
fn decode_item(id: &str, fragment: &str) -> Result<ItemRecord, String> {
    let open = fragment
        .find('{')
        .ok_or_else(|| "item value is not an object".to_string())?;
    if !fragment[..open].trim().is_empty() {
        return Err("item value is not an object".to_string());
    }

    let interior = fragment[open + 1..].trim_end();
    let interior = interior
        .strip_suffix([',', '}'])
        .ok_or_else(|| "item is not followed by a separator".to_string())?
        .trim_end();
    let members = interior
        .strip_suffix('}')
        .ok_or_else(|| "item object is not closed".to_string())?
        .trim();

    let id_json = serde_json::to_string(id).map_err(|e| e.to_string())?;
    let rebuilt = if members.is_empty() {
        format!("{{\"id\":{id_json}}}")
    } else {
        format!("{{\"id\":{id_json},{members}}}")
    };

    serde_json::from_str(&rebuilt).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Listing;

    fn ids(values: &[&str]) -> Vec<ItemId> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn record_ids(result: &PartitionResult) -> Vec<&str> {
        result.records.iter().map(|r| r.id.as_str()).collect()
    }

    const COMPACT: &str = concat!(
        r#"{"items":{"#,
        r#""5116":{"listings":[{"pricePerUnit":120,"worldName":"Gilgamesh"},{"pricePerUnit":150,"worldName":"Jenova"}],"averagePrice":131.5,"unitsSold":12},"#,
        r#""5117":{"listings":[{"pricePerUnit":9,"worldName":"Sargatanas"}],"averagePrice":10.0,"unitsSold":400},"#,
        r#""5118":{"listings":[],"averagePrice":0.0,"unitsSold":0}"#,
        r#"},"dcName":"Aether"}"#
    );

    #[test]
    fn test_all_items_present() {
        let result = extract(COMPACT.as_bytes(), &ids(&["5116", "5117", "5118"])).unwrap();

        assert_eq!(result.partition_name, "Aether");
        assert_eq!(record_ids(&result), vec!["5116", "5117", "5118"]);
        assert!(result.item_errors.is_empty());
        assert!(result.missing_ids().is_empty());

        let first = &result.records[0];
        assert_eq!(first.units_sold, 12);
        assert_eq!(first.average_price, 131.5);
        assert_eq!(
            first.listings[1],
            Listing {
                price_per_unit: 150,
                world_name: Some("Jenova".to_string()),
            }
        );
        assert!(result.records[2].listings.is_empty());
    }

    #[test]
    fn test_absent_item_is_dropped() {
        let body = concat!(
            r#"{"items":{"#,
            r#""100":{"listings":[{"pricePerUnit":5,"worldName":"Adamantoise"}],"averagePrice":5.5,"unitsSold":3},"#,
            r#""102":{"listings":[],"averagePrice":1.0,"unitsSold":1}"#,
            r#"},"dcName":"Aether"}"#
        );

        let result = extract(body.as_bytes(), &ids(&["100", "101", "102"])).unwrap();

        assert_eq!(record_ids(&result), vec!["100", "102"]);
        assert_eq!(result.missing_ids(), vec!["101"]);
        assert_eq!(result.requested_ids, ids(&["100", "101", "102"]));
    }

    #[test]
    fn test_leading_and_trailing_items_absent() {
        let body = r#"{"items":{"2":{"listings":[],"averagePrice":2.0,"unitsSold":2}},"dcName":"Primal"}"#;

        let result = extract(body.as_bytes(), &ids(&["1", "2", "3", "4"])).unwrap();

        assert_eq!(result.partition_name, "Primal");
        assert_eq!(record_ids(&result), vec!["2"]);
        assert_eq!(result.records[0].units_sold, 2);
        assert_eq!(result.missing_ids(), vec!["1", "3", "4"]);
    }

    #[test]
    fn test_absent_ids_before_and_between_present_items() {
        let body = r#"{"items":{"1":{"listings":[],"averagePrice":1.0,"unitsSold":1},"2":{"listings":[],"averagePrice":2.0,"unitsSold":2}},"dcName":"Aether"}"#;

        let result = extract(body.as_bytes(), &ids(&["9", "1", "5", "2"])).unwrap();

        assert_eq!(record_ids(&result), vec!["1", "2"]);
        assert_eq!(result.records[0].units_sold, 1);
        assert_eq!(result.records[1].units_sold, 2);
        assert_eq!(result.missing_ids(), vec!["9", "5"]);
    }

    #[test]
    fn test_no_items_present() {
        let body = r#"{"items":{},"dcName":"Crystal"}"#;

        let result = extract(body.as_bytes(), &ids(&["1", "2"])).unwrap();

        assert_eq!(result.partition_name, "Crystal");
        assert!(result.records.is_empty());
        assert_eq!(result.missing_ids(), vec!["1", "2"]);
    }

    #[test]
    fn test_world_name_fallback() {
        let body = concat!(
            r#"{"items":{"5116":{"listings":[{"pricePerUnit":77}],"averagePrice":80.0,"unitsSold":4}},"#,
            r#""worldName":"Gilgamesh"}"#
        );

        let result = extract(body.as_bytes(), &ids(&["5116"])).unwrap();

        assert_eq!(result.partition_name, "Gilgamesh");
        assert_eq!(result.records[0].listings[0].world_name, None);
        assert_eq!(result.records[0].listings[0].price_per_unit, 77);
    }

    #[test]
    fn test_dc_name_preferred_over_world_name() {
        let body = concat!(
            r#"{"items":{"1":{"listings":[{"pricePerUnit":1,"worldName":"Siren"}],"averagePrice":1.0,"unitsSold":1}},"#,
            r#""dcName":"Aether"}"#
        );

        let result = extract(body.as_bytes(), &ids(&["1"])).unwrap();

        assert_eq!(result.partition_name, "Aether");
        assert_eq!(
            result.records[0].listings[0].world_name.as_deref(),
            Some("Siren")
        );
    }

    #[test]
    fn test_pretty_printed_response() {
        let body = r#"{
  "items": {
    "5116": {
      "listings": [
        { "pricePerUnit": 120, "worldName": "Gilgamesh" }
      ],
      "averagePrice": 130.5,
      "unitsSold": 12
    },
    "5118": {
      "listings": [],
      "averagePrice": 3.25,
      "unitsSold": 3
    }
  },
  "dcName" : "Aether"
}
"#;

        let result = extract(body.as_bytes(), &ids(&["5116", "5117", "5118"])).unwrap();

        assert_eq!(result.partition_name, "Aether");
        assert_eq!(record_ids(&result), vec!["5116", "5118"]);
        assert_eq!(result.records[1].average_price, 3.25);
    }

    #[test]
    fn test_last_item_consumes_rest_of_buffer() {
        let body = concat!(
            r#"{"items":{"7":{"listings":[],"averagePrice":1.0,"unitsSold":1},"#,
            r#""8":{"listings":[{"pricePerUnit":42,"worldName":"Faerie"}],"averagePrice":40.0,"unitsSold":9}}"#,
            r#","dcName":"Aether"}"#
        );

        let result = extract(body.as_bytes(), &ids(&["7", "8"])).unwrap();

        let last = &result.records[1];
        assert_eq!(last.id, "8");
        assert_eq!(last.units_sold, 9);
        assert_eq!(last.listings[0].price_per_unit, 42);
    }

    #[test]
    fn test_malformed_item_does_not_abort_siblings() {
        let body = concat!(
            r#"{"items":{"#,
            r#""1":{"listings":[],"averagePrice":1.0,"unitsSold":1},"#,
            r#""2":{"listings":"not a list","averagePrice":2.0,"unitsSold":2},"#,
            r#""3":{"listings":[],"averagePrice":3.0,"unitsSold":3}"#,
            r#"},"dcName":"Aether"}"#
        );

        let result = extract(body.as_bytes(), &ids(&["1", "2", "3"])).unwrap();

        assert_eq!(record_ids(&result), vec!["1", "3"]);
        assert_eq!(result.item_errors.len(), 1);
        assert!(matches!(
            &result.item_errors[0],
            ExtractionError::MalformedItem { id, .. } if id == "2"
        ));
        assert!(result.missing_ids().is_empty());
    }

    #[test]
    fn test_non_object_item_is_malformed() {
        let body = r#"{"items":{"1":null,"2":{"listings":[],"averagePrice":2.0,"unitsSold":2}},"dcName":"Aether"}"#;

        let result = extract(body.as_bytes(), &ids(&["1", "2"])).unwrap();

        assert_eq!(record_ids(&result), vec!["2"]);
        assert!(matches!(
            &result.item_errors[0],
            ExtractionError::MalformedItem { id, .. } if id == "1"
        ));
    }

    #[test]
    fn test_empty_item_object_decodes_to_defaults() {
        let body = r#"{"items":{"1":{}},"dcName":"Aether"}"#;

        let result = extract(body.as_bytes(), &ids(&["1"])).unwrap();

        assert_eq!(result.records.len(), 1);
        assert!(result.records[0].listings.is_empty());
        assert_eq!(result.records[0].units_sold, 0);
    }

    #[test]
    fn test_id_as_string_value_is_not_a_key() {
        // "9" shows up as a world name before it shows up as an items key.
        let body = concat!(
            r#"{"items":{"#,
            r#""1":{"listings":[{"pricePerUnit":1,"worldName":"9"}],"averagePrice":1.0,"unitsSold":1},"#,
            r#""9":{"listings":[],"averagePrice":9.0,"unitsSold":9}"#,
            r#"},"dcName":"Aether"}"#
        );

        let result = extract(body.as_bytes(), &ids(&["1", "9"])).unwrap();

        assert_eq!(record_ids(&result), vec!["1", "9"]);
        assert_eq!(result.records[0].listings[0].world_name.as_deref(), Some("9"));
        assert_eq!(result.records[1].units_sold, 9);
    }

    #[test]
    fn test_missing_partition_field() {
        let body = r#"{"items":{"1":{"listings":[],"averagePrice":1.0,"unitsSold":1}}}"#;

        assert_eq!(
            extract(body.as_bytes(), &ids(&["1"])),
            Err(ExtractionError::NoPartitionField)
        );
    }

    #[test]
    fn test_non_string_partition_value_is_malformed() {
        let body = r#"{"items":{},"dcName":42}"#;

        assert!(matches!(
            extract(body.as_bytes(), &ids(&["1"])),
            Err(ExtractionError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_partition_value_is_malformed() {
        let body = r#"{"items":{},"dcName":""}"#;

        assert!(matches!(
            extract(body.as_bytes(), &ids(&["1"])),
            Err(ExtractionError::Malformed(_))
        ));
    }

    #[test]
    fn test_partition_field_before_items_is_malformed() {
        let body = r#"{"dcName":"Aether","items":{"1":{"listings":[],"averagePrice":1.0,"unitsSold":1}}}"#;

        assert!(matches!(
            extract(body.as_bytes(), &ids(&["1"])),
            Err(ExtractionError::Malformed(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_is_malformed() {
        let body = [b'{', 0xff, 0xfe, b'}'];

        assert!(matches!(
            extract(&body, &ids(&["1"])),
            Err(ExtractionError::Malformed(_))
        ));
    }
}
