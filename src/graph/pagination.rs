//! Cursor-based pagination types for graph connections.
//!
//! Implements the Relay connection shape with a pluggable cursor rule, so
//! offset pagination and keyset pagination share one envelope.
//!
//! Usage: Use the `define_connection!` macro to create type-specific
//! connections for graph schemas.

use async_graphql::SimpleObject;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

/// Information about pagination in a connection
#[derive(SimpleObject, Debug, Clone, Default)]
pub struct PageInfo {
    /// When paginating forwards, are there more items?
    pub has_next_page: bool,
    /// When paginating backwards, are there more items?
    pub has_previous_page: bool,
    /// Cursor of the first item in this page
    pub start_cursor: Option<String>,
    /// Cursor of the last item in this page
    pub end_cursor: Option<String>,
    /// Total count of items (if available)
    pub total_count: Option<i64>,
}

/// An edge in a connection, containing a node and cursor (internal use)
#[derive(Debug, Clone)]
pub struct Edge<T> {
    /// The item at the end of the edge
    pub node: T,
    /// A cursor for pagination
    pub cursor: String,
}

/// A paginated connection result (internal use)
#[derive(Debug, Clone)]
pub struct Connection<T> {
    /// The edges in this connection
    pub edges: Vec<Edge<T>>,
    /// Pagination information
    pub page_info: PageInfo,
}

/// Inputs the cursor rules work from.
///
/// `after` is the decoded position of the supplied cursor (0 when absent),
/// `first` the requested page size. `total` is the count for the same
/// predicates; the offset rule needs it, the id rule does not.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionArgs {
    pub after: i64,
    pub first: i64,
    pub total: Option<i64>,
}

/// Pluggable cursor assignment for connection pages.
pub trait CursorRule<T> {
    /// Cursor payload for the edge at `index` within this page.
    fn edge_cursor(&self, node: &T, index: usize, args: &ConnectionArgs) -> i64;

    /// Whether another page exists after this one.
    fn has_next(&self, args: &ConnectionArgs, returned: usize) -> bool;
}

/// Offset-based cursors: each edge's cursor is its absolute position.
///
/// Requires `total`; a short page never reports a next page.
#[derive(Debug, Clone, Copy, Default)]
pub struct OffsetCursor;

impl<T> CursorRule<T> for OffsetCursor {
    fn edge_cursor(&self, _node: &T, index: usize, args: &ConnectionArgs) -> i64 {
        args.after + index as i64
    }

    fn has_next(&self, args: &ConnectionArgs, returned: usize) -> bool {
        (returned as i64) >= args.first
            && args.total.is_some_and(|total| args.after + args.first < total)
    }
}

/// Keyset cursors: each edge's cursor is the node's own identifier and the
/// next page exists exactly when this page came back full, so no second
/// count query is needed.
pub struct IdCursor<T> {
    extract: fn(&T) -> i64,
}

impl<T> IdCursor<T> {
    pub fn new(extract: fn(&T) -> i64) -> Self {
        Self { extract }
    }
}

impl<T> CursorRule<T> for IdCursor<T> {
    fn edge_cursor(&self, node: &T, _index: usize, _args: &ConnectionArgs) -> i64 {
        (self.extract)(node)
    }

    fn has_next(&self, args: &ConnectionArgs, returned: usize) -> bool {
        (returned as i64) >= args.first
    }
}

/// Macro to define a graph connection type for a specific node type
///
/// Usage:
/// ```ignore
/// define_connection!(PostConnection, PostEdge, Post);
/// ```
#[macro_export]
macro_rules! define_connection {
    ($conn_name:ident, $edge_name:ident, $node_type:ty) => {
        /// Edge containing a node and cursor
        #[derive(async_graphql::SimpleObject, Debug, Clone)]
        pub struct $edge_name {
            /// The item at the end of the edge
            pub node: $node_type,
            /// A cursor for pagination
            pub cursor: String,
        }

        /// Connection containing edges and page info
        #[derive(async_graphql::SimpleObject, Debug, Clone)]
        pub struct $conn_name {
            /// The edges in this connection
            pub edges: Vec<$edge_name>,
            /// Pagination information
            pub page_info: $crate::graph::pagination::PageInfo,
        }

        impl $conn_name {
            /// Create from a generic Connection
            pub fn from_connection(
                conn: $crate::graph::pagination::Connection<$node_type>,
            ) -> Self {
                Self {
                    edges: conn
                        .edges
                        .into_iter()
                        .map(|e| $edge_name {
                            node: e.node,
                            cursor: e.cursor,
                        })
                        .collect(),
                    page_info: conn.page_info,
                }
            }
        }
    };
}

impl<T> Connection<T> {
    /// Create an empty connection
    pub fn empty() -> Self {
        Self {
            edges: Vec::new(),
            page_info: PageInfo {
                has_next_page: false,
                has_previous_page: false,
                start_cursor: None,
                end_cursor: None,
                total_count: Some(0),
            },
        }
    }

    /// Build a connection from one fetched page under the given cursor rule.
    ///
    /// `startCursor`/`endCursor` are always the first/last edge's own cursor.
    pub fn assemble(items: Vec<T>, args: &ConnectionArgs, rule: &impl CursorRule<T>) -> Self {
        let has_next_page = rule.has_next(args, items.len());
        let has_previous_page = args.after > 0;

        let edges: Vec<Edge<T>> = items
            .into_iter()
            .enumerate()
            .map(|(i, node)| Edge {
                cursor: encode_cursor(rule.edge_cursor(&node, i, args)),
                node,
            })
            .collect();

        let page_info = PageInfo {
            has_next_page,
            has_previous_page,
            start_cursor: edges.first().map(|e| e.cursor.clone()),
            end_cursor: edges.last().map(|e| e.cursor.clone()),
            total_count: args.total,
        };

        Self { edges, page_info }
    }

    /// Create an offset-cursor connection from a list of items
    ///
    /// # Arguments
    /// * `items` - The items to include in this page
    /// * `offset` - The offset of the first item (for cursor generation)
    /// * `limit` - The requested limit (to determine if there are more pages)
    /// * `total` - Total count of items matching the query
    pub fn from_items(items: Vec<T>, offset: i64, limit: i64, total: i64) -> Self {
        let args = ConnectionArgs {
            after: offset,
            first: limit,
            total: Some(total),
        };
        Self::assemble(items, &args, &OffsetCursor)
    }
}

/// Encode an offset or identifier as a cursor string
pub fn encode_cursor(offset: i64) -> String {
    BASE64.encode(format!("cursor:{}", offset))
}

/// Decode a cursor string back to its payload
pub fn decode_cursor(cursor: &str) -> Result<i64, &'static str> {
    let decoded = BASE64.decode(cursor).map_err(|_| "invalid cursor format")?;

    let s = String::from_utf8(decoded).map_err(|_| "invalid cursor encoding")?;

    if !s.starts_with("cursor:") {
        return Err("invalid cursor prefix");
    }

    s[7..].parse().map_err(|_| "invalid cursor value")
}

/// Parse pagination arguments into offset and limit
pub fn parse_pagination_args(
    first: Option<i32>,
    after: Option<String>,
) -> Result<(i64, i64), &'static str> {
    let limit = first.unwrap_or(25).min(100) as i64;

    let offset = if let Some(cursor) = after {
        decode_cursor(&cursor)? + 1 // Start after the cursor
    } else {
        0
    };

    Ok((offset, limit))
}
