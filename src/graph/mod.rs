//! Graph-side result envelopes: connections, edges and the cursor codec.

pub mod pagination;

pub use pagination::{
    Connection, ConnectionArgs, CursorRule, Edge, IdCursor, OffsetCursor, PageInfo,
    decode_cursor, encode_cursor, parse_pagination_args,
};
