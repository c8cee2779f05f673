#![forbid(unsafe_code)]

mod items;
mod store;

pub use items::{
    FileItemStore, IndexEntry, ItemFile, ItemMetadata, NewItem, OperationState, date_key,
};
pub use store::*;
