#![forbid(unsafe_code)]

//! # roslink
//!
//! The `roslink` crate is an asynchronous ROS1 client runtime: nodes
//! register with a ROS master, exchange typed messages over TCPROS, call
//! and serve services, and track long-running goals with an action client.
//!
//! Messages are runtime-typed: a [`MessageType`](msg::MessageType) pairs a
//! wire-level schema with its type name and MD5 fingerprint, and a
//! [`DynamicMessage`](msg::DynamicMessage) is one instance of it. No code
//! generation is required to participate in a graph.
//!
//! ## Constructing a Node
//!
//! A [Node] is usually built through [NodeBuilder], which resolves the
//! master URI, namespace, and advertised hostname from remappings and the
//! environment (`ROS_MASTER_URI`, `ROS_NAMESPACE`, `ROS_HOSTNAME`,
//! `ROS_IP`):
//!
//! ```rust,no_run
//! use roslink::builder::NodeBuilder;
//!
//! #[tokio::main(flavor = "multi_thread", worker_threads = 4)]
//! async fn main() {
//!     // Construct a node without any customization.
//!     let node = NodeBuilder::new().build().await.unwrap();
//!
//!     // Or override the parts that matter.
//!     let custom = NodeBuilder::new()
//!         .name("/cool_node")
//!         .master_url("http://127.0.1.1:11311")
//!         .build()
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! `Node::new(name, argv)` additionally applies the ROS1 command-line
//! conventions: `a:=b` tokens remap names, `__name`/`__ns`/`__master`/
//! `__ip`/`__hostname`/`__log` configure the node, and everything else is
//! preserved as [`Node::non_ros_args`].
//!
//! ## Publishing to a Topic
//!
//! ```rust,no_run
//! use roslink::{
//!     builder::NodeBuilder,
//!     msg::{FieldSpec, FieldType, MessageSchema, MessageType, Value},
//! };
//!
//! #[tokio::main(flavor = "multi_thread", worker_threads = 4)]
//! async fn main() {
//!     let node = NodeBuilder::new().build().await.unwrap();
//!
//!     let string_type = MessageType::with_md5(
//!         "std_msgs/String",
//!         "string data\n",
//!         "992ce8a1687cec8c8bd883ec73ca41d1",
//!         MessageSchema::new(vec![FieldSpec::scalar("data", FieldType::String)]),
//!     );
//!
//!     let publisher = node
//!         .advertise("/chatter", &string_type, 1024, false, false)
//!         .await
//!         .unwrap();
//!
//!     let mut msg = string_type.new_message();
//!     msg.set("data", Value::String("Hello world!".into())).unwrap();
//!     publisher.publish(&msg).await.unwrap();
//! }
//! ```
//!
//! ## Subscribing to a Topic
//!
//! Callbacks come in three shapes — message only, message plus
//! [`MessageEvent`](tcpros::MessageEvent), or event only — and all run on
//! the node's callback loop, so two callbacks of the same node never run
//! concurrently. Drive the loop with [`Node::spin`] or [`Node::spin_once`]:
//!
//! ```rust,no_run
//! # use roslink::{builder::NodeBuilder, msg::MessageType, tcpros::subscription::MessageCallback};
//! # async fn demo(string_type: MessageType) {
//! let node = NodeBuilder::new().build().await.unwrap();
//!
//! let _subscriber = node
//!     .subscribe("/chatter", &string_type, false, MessageCallback::message(|msg| {
//!         println!("got: {:?}", msg.get("data"));
//!     }))
//!     .await
//!     .unwrap();
//!
//! node.spin().await;
//! # }
//! ```
//!
//! ## Actions
//!
//! [`SimpleActionClient`](action::SimpleActionClient) wraps the full
//! goal-status protocol into a three-state view with optional done /
//! active / feedback callbacks, mirroring the classic `actionlib` simple
//! client.

pub mod action;
pub mod codec;
pub mod dispatch;
pub mod msg;
pub mod node;
pub mod tcpros;
pub mod time;
pub mod xmlrpc;

pub use node::{
    builder, Node, NodeError, Publisher, ServiceClient, ServiceServer, Subscriber,
};
