//! Test doubles for exercising the client against an in-process node
//!
//! # Example
//!
//! ```ignore
//! use cellar_client::testing::MockNode;
//!
//! #[tokio::test]
//! async fn test_my_app() {
//!     let node = MockNode::start().await;
//!     node.put_document(b"greeting", b"{\"hello\":\"world\"}");
//!
//!     let bucket = node.bucket("travel").await;
//!     let result = bucket.get(b"greeting".to_vec(), Default::default()).await.unwrap();
//!     assert_eq!(result.value, b"{\"hello\":\"world\"}");
//! }
//! ```

pub mod fixtures;
pub mod mock_node;

pub use mock_node::{MockNode, ScriptedReply};
