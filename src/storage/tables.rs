use crate::tables::ItemId;
use crate::value::Scalar;
use crate::AppError;
use redb::TableDefinition;

/// Record registry. A row exists for every live record id.
pub const RECORDS: TableDefinition<u64, ()> = TableDefinition::new("records");

/// One-one field payloads, keyed `(field, record)`, bincode `Scalar` rows.
pub const SCALARS: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("scalars");

/// Shared-value rows, keyed `(field, item_id)`, display string values.
pub const ITEMS: TableDefinition<(&str, u64), &str> = TableDefinition::new("items");

/// Ordered reference lists, keyed `(field, record)`, bincode `Vec<ItemId>`.
pub const LINKS: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("links");

/// Records with changes not yet mirrored to a snapshot; value is the
/// `last_modified` stamp in microseconds.
pub const DIRTY: TableDefinition<u64, i64> = TableDefinition::new("dirty");

/// Last durable snapshot per record, as produced by the snapshot codec.
pub const BACKUPS: TableDefinition<u64, &[u8]> = TableDefinition::new("backups");

pub fn encode_scalar(scalar: &Scalar) -> Result<Vec<u8>, AppError> {
    Ok(bincode::serialize(scalar)?)
}

pub fn decode_scalar(bytes: &[u8]) -> Result<Scalar, AppError> {
    Ok(bincode::deserialize(bytes)?)
}

pub fn encode_ids(ids: &[ItemId]) -> Result<Vec<u8>, AppError> {
    Ok(bincode::serialize(ids)?)
}

pub fn decode_ids(bytes: &[u8]) -> Result<Vec<ItemId>, AppError> {
    Ok(bincode::deserialize(bytes)?)
}
