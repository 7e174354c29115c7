//! A scriptable action server for exercising the client state machine.
//!
//! Tests drive it explicitly: they wait for a goal to arrive, then publish
//! whatever status sequence the scenario calls for.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use roslink::{
    action::{self, ActionType, GoalStatus},
    msg::{DynamicMessage, Value},
    node::{Node, Publisher},
    tcpros::subscription::MessageCallback,
    time::Time,
};

use crate::util::{sibling_node, wait_until};

pub struct MockActionServer {
    pub node: Node,
    namespace: String,
    action_type: ActionType,
    status_pub: Publisher,
    result_pub: Publisher,
    _feedback_pub: Publisher,
    _goal_sub: roslink::Subscriber,
    _cancel_sub: roslink::Subscriber,
    goals: Arc<Mutex<Vec<String>>>,
    cancels: Arc<Mutex<Vec<String>>>,
}

impl MockActionServer {
    pub async fn start(client_node: &Node, namespace: &str, action_type: &ActionType) -> Self {
        let node = sibling_node(client_node, "/mock_action_server").await;

        let status_pub = node
            .advertise(
                &format!("{namespace}/status"),
                &action::goal_status_array_type(),
                10,
                false,
                false,
            )
            .await
            .unwrap();

        let result_pub = node
            .advertise(
                &format!("{namespace}/result"),
                action_type.result(),
                10,
                false,
                false,
            )
            .await
            .unwrap();

        let feedback_pub = node
            .advertise(
                &format!("{namespace}/feedback"),
                action_type.feedback(),
                10,
                false,
                false,
            )
            .await
            .unwrap();

        let goals = Arc::new(Mutex::new(Vec::new()));
        let cancels = Arc::new(Mutex::new(Vec::new()));

        let goal_sub = {
            let goals = goals.clone();

            node.subscribe(
                &format!("{namespace}/goal"),
                action_type.goal(),
                false,
                MessageCallback::message(move |msg| {
                    let goal_id = msg
                        .get("goal_id")
                        .and_then(Value::as_message)
                        .and_then(|goal_id| goal_id.get("id"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();

                    goals.lock().unwrap().push(goal_id);
                }),
            )
            .await
            .unwrap()
        };

        let cancel_sub = {
            let cancels = cancels.clone();

            node.subscribe(
                &format!("{namespace}/cancel"),
                &action::goal_id_type(),
                false,
                MessageCallback::message(move |msg| {
                    let goal_id = msg
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();

                    cancels.lock().unwrap().push(goal_id);
                }),
            )
            .await
            .unwrap()
        };

        // The server's subscription callbacks need a spinning node.
        {
            let node = node.clone();
            tokio::spawn(async move { node.spin().await });
        }

        MockActionServer {
            node,
            namespace: namespace.to_string(),
            action_type: action_type.clone(),
            status_pub,
            result_pub,
            _feedback_pub: feedback_pub,
            _goal_sub: goal_sub,
            _cancel_sub: cancel_sub,
            goals,
            cancels,
        }
    }

    /// Wait until the five action topics are wired between client and
    /// server.
    pub async fn wait_for_wiring(&self) {
        let node = &self.node;
        let namespace = self.namespace.clone();

        tokio::time::timeout(
            Duration::from_secs(10),
            wait_until(|| {
                let namespace = namespace.clone();
                async move {
                    for topic in ["status", "result", "feedback"] {
                        let subscribers = node
                            .get_connected_subscriber_ids(&format!("{namespace}/{topic}"))
                            .await?
                            .unwrap_or_default();

                        if subscribers.is_empty() {
                            return Ok(None);
                        }
                    }

                    for topic in ["goal", "cancel"] {
                        let publishers = node
                            .get_connected_publisher_uris(&format!("{namespace}/{topic}"))
                            .await?
                            .unwrap_or_default();

                        if publishers.is_empty() {
                            return Ok(None);
                        }
                    }

                    Ok(Some(()))
                }
            }),
        )
        .await
        .expect("Timed out waiting for action topic wiring")
        .unwrap();
    }

    pub async fn wait_for_goal(&self) -> String {
        let goals = self.goals.clone();

        tokio::time::timeout(
            Duration::from_secs(5),
            wait_until(|| {
                let goals = goals.clone();
                async move { Ok(goals.lock().unwrap().last().cloned()) }
            }),
        )
        .await
        .expect("Timed out waiting for a goal")
        .unwrap()
    }

    pub async fn wait_for_cancel(&self) -> String {
        let cancels = self.cancels.clone();

        tokio::time::timeout(
            Duration::from_secs(5),
            wait_until(|| {
                let cancels = cancels.clone();
                async move { Ok(cancels.lock().unwrap().last().cloned()) }
            }),
        )
        .await
        .expect("Timed out waiting for a cancel")
        .unwrap()
    }

    /// Publish a status array naming this goal.
    pub async fn publish_status(&self, goal_id: &str, status: GoalStatus) {
        let array_type = action::goal_status_array_type();
        let mut msg = array_type.new_message();

        msg.set(
            "status_list",
            Value::Array(vec![make_goal_status(goal_id, status)]),
        )
        .unwrap();

        self.status_pub.publish(&msg).await.unwrap();
    }

    /// Publish a result for this goal with the given terminal status.
    pub async fn publish_result(
        &self,
        goal_id: &str,
        status: GoalStatus,
        result: DynamicMessage,
    ) {
        let mut msg = self.action_type.result().new_message();

        let Value::Message(status_msg) = make_goal_status(goal_id, status) else {
            unreachable!("make_goal_status returns a message value");
        };

        msg.set("status", Value::Message(status_msg)).unwrap();
        msg.set("result", Value::Message(result)).unwrap();

        self.result_pub.publish(&msg).await.unwrap();
    }
}

/// Build an `actionlib_msgs/GoalStatus` value for a status array.
pub fn make_goal_status(goal_id: &str, status: GoalStatus) -> Value {
    let array_type = action::goal_status_array_type();

    let status_schema = match &array_type.schema().field("status_list").unwrap().ty {
        roslink::msg::FieldType::Nested(schema) => schema.clone(),
        _ => unreachable!("status_list holds nested GoalStatus messages"),
    };

    let goal_id_schema = match &status_schema.field("goal_id").unwrap().ty {
        roslink::msg::FieldType::Nested(schema) => schema.clone(),
        _ => unreachable!("goal_id is a nested GoalID message"),
    };

    let mut goal_id_msg = DynamicMessage::new(goal_id_schema);
    goal_id_msg.set("stamp", Value::Time(Time::now())).unwrap();
    goal_id_msg
        .set("id", Value::String(goal_id.to_string()))
        .unwrap();

    let mut status_msg = DynamicMessage::new(status_schema);
    status_msg
        .set("goal_id", Value::Message(goal_id_msg))
        .unwrap();
    status_msg.set("status", Value::U8(status.as_u8())).unwrap();
    status_msg
        .set("text", Value::String(String::new()))
        .unwrap();

    Value::Message(status_msg)
}
