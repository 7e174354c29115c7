//! Action-client support: goal identifiers, the goal-status state machine,
//! and the full and "simple" clients layered over plain topics.
//!
//! The wire types mirror `actionlib_msgs`; wrapper message types for a
//! concrete action are derived from its goal/result/feedback types at
//! runtime.

mod client;
mod goal_id;
mod simple;

use std::{fmt, sync::Arc, sync::LazyLock};

use crate::{
    msg::{DynamicMessage, FieldSpec, FieldType, MessageSchema, MessageType, Value},
    node::NodeError,
    tcpros::publication::PublishError,
    time::Time,
};

pub use {
    client::{ActionClient, ClientGoalHandle, FeedbackCallback, TransitionCallback},
    goal_id::GoalIdGenerator,
    simple::{
        ActiveCallback, DoneCallback, SimpleActionClient, SimpleFeedbackCallback, SimpleGoalState,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("no goal is being tracked")]
    NoGoal,
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Terminal and intermediate statuses reported by an action server, as
/// defined by `actionlib_msgs/GoalStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalStatus {
    Pending,
    Active,
    Preempted,
    Succeeded,
    Aborted,
    Rejected,
    Preempting,
    Recalling,
    Recalled,
    Lost,
}

impl GoalStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => GoalStatus::Pending,
            1 => GoalStatus::Active,
            2 => GoalStatus::Preempted,
            3 => GoalStatus::Succeeded,
            4 => GoalStatus::Aborted,
            5 => GoalStatus::Rejected,
            6 => GoalStatus::Preempting,
            7 => GoalStatus::Recalling,
            8 => GoalStatus::Recalled,
            9 => GoalStatus::Lost,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            GoalStatus::Pending => 0,
            GoalStatus::Active => 1,
            GoalStatus::Preempted => 2,
            GoalStatus::Succeeded => 3,
            GoalStatus::Aborted => 4,
            GoalStatus::Rejected => 5,
            GoalStatus::Preempting => 6,
            GoalStatus::Recalling => 7,
            GoalStatus::Recalled => 8,
            GoalStatus::Lost => 9,
        }
    }
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Client-side view of where a goal sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommState {
    WaitingForGoalAck,
    Pending,
    Active,
    WaitingForResult,
    WaitingForCancelAck,
    Recalling,
    Preempting,
    Done,
}

impl fmt::Display for CommState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A status update that the comm-state machine has no edge for. Logged and
/// ignored; never fatal.
#[derive(Debug, thiserror::Error)]
#[error("illegal goal transition: status {status} while in comm state {from}")]
pub struct IllegalTransition {
    pub from: CommState,
    pub status: GoalStatus,
}

/// The comm-state edges of the client goal state machine.
///
/// Some server statuses imply intermediate states the client never saw on
/// the wire (e.g. a `Preempted` status while we still wait for the goal
/// ack); those intermediates are returned in order so every transition
/// callback still fires.
pub(crate) fn transition_states(
    from: CommState,
    status: GoalStatus,
) -> Result<Vec<CommState>, IllegalTransition> {
    use CommState::*;
    use GoalStatus as S;

    let states: &[CommState] = match (from, status) {
        (WaitingForGoalAck, S::Pending) => &[Pending],
        (WaitingForGoalAck, S::Active) => &[Active],
        (WaitingForGoalAck, S::Rejected) => &[Pending, WaitingForResult],
        (WaitingForGoalAck, S::Recalling) => &[Pending, Recalling],
        (WaitingForGoalAck, S::Recalled) => &[Pending, WaitingForResult],
        (WaitingForGoalAck, S::Preempted) => &[Active, Preempting, WaitingForResult],
        (WaitingForGoalAck, S::Succeeded | S::Aborted) => &[Active, WaitingForResult],
        (WaitingForGoalAck, S::Preempting) => &[Active, Preempting],

        (Pending, S::Pending) => &[],
        (Pending, S::Active) => &[Active],
        (Pending, S::Rejected) => &[WaitingForResult],
        (Pending, S::Recalling) => &[Recalling],
        (Pending, S::Recalled) => &[Recalling, WaitingForResult],
        (Pending, S::Preempted) => &[Active, Preempting, WaitingForResult],
        (Pending, S::Succeeded | S::Aborted) => &[Active, WaitingForResult],
        (Pending, S::Preempting) => &[Active, Preempting],

        (Active, S::Active) => &[],
        (Active, S::Preempted) => &[Preempting, WaitingForResult],
        (Active, S::Succeeded | S::Aborted) => &[WaitingForResult],
        (Active, S::Preempting) => &[Preempting],

        (WaitingForResult, S::Active | S::Rejected | S::Recalled) => &[],
        (WaitingForResult, S::Preempted | S::Succeeded | S::Aborted) => &[],

        (WaitingForCancelAck, S::Pending | S::Active) => &[],
        (WaitingForCancelAck, S::Rejected) => &[WaitingForResult],
        (WaitingForCancelAck, S::Recalling) => &[Recalling],
        (WaitingForCancelAck, S::Recalled) => &[Recalling, WaitingForResult],
        (WaitingForCancelAck, S::Preempted | S::Succeeded | S::Aborted) => {
            &[Preempting, WaitingForResult]
        }
        (WaitingForCancelAck, S::Preempting) => &[Preempting],

        (Recalling, S::Recalling) => &[],
        (Recalling, S::Rejected | S::Recalled) => &[WaitingForResult],
        (Recalling, S::Preempted | S::Succeeded | S::Aborted) => &[Preempting, WaitingForResult],
        (Recalling, S::Preempting) => &[Preempting],

        (Preempting, S::Preempting) => &[],
        (Preempting, S::Preempted | S::Succeeded | S::Aborted) => &[WaitingForResult],

        (Done, S::Preempted | S::Succeeded | S::Aborted | S::Rejected | S::Recalled) => &[],

        (from, status) => return Err(IllegalTransition { from, status }),
    };

    Ok(states.to_vec())
}

static HEADER_SCHEMA: LazyLock<Arc<MessageSchema>> = LazyLock::new(|| {
    Arc::new(MessageSchema::new(vec![
        FieldSpec::scalar("seq", FieldType::U32),
        FieldSpec::scalar("stamp", FieldType::Time),
        FieldSpec::scalar("frame_id", FieldType::String),
    ]))
});

static GOAL_ID_SCHEMA: LazyLock<Arc<MessageSchema>> = LazyLock::new(|| {
    Arc::new(MessageSchema::new(vec![
        FieldSpec::scalar("stamp", FieldType::Time),
        FieldSpec::scalar("id", FieldType::String),
    ]))
});

static GOAL_STATUS_SCHEMA: LazyLock<Arc<MessageSchema>> = LazyLock::new(|| {
    Arc::new(MessageSchema::new(vec![
        FieldSpec::scalar("goal_id", FieldType::Nested(GOAL_ID_SCHEMA.clone())),
        FieldSpec::scalar("status", FieldType::U8),
        FieldSpec::scalar("text", FieldType::String),
    ]))
});

static STATUS_ARRAY_SCHEMA: LazyLock<Arc<MessageSchema>> = LazyLock::new(|| {
    Arc::new(MessageSchema::new(vec![
        FieldSpec::scalar("header", FieldType::Nested(HEADER_SCHEMA.clone())),
        FieldSpec::dynamic_array("status_list", FieldType::Nested(GOAL_STATUS_SCHEMA.clone())),
    ]))
});

/// `actionlib_msgs/GoalID`, used on every `<ns>/cancel` topic.
pub fn goal_id_type() -> MessageType {
    MessageType::with_md5(
        "actionlib_msgs/GoalID",
        "time stamp\nstring id\n",
        "302881f31927c1df708a2dbab0e80ee8",
        GOAL_ID_SCHEMA.as_ref().clone(),
    )
}

/// `actionlib_msgs/GoalStatusArray`, published on every `<ns>/status`
/// topic.
pub fn goal_status_array_type() -> MessageType {
    MessageType::with_md5(
        "actionlib_msgs/GoalStatusArray",
        "Header header\nGoalStatus[] status_list\n",
        "8b2b82f13216d0a8ea88bd3af735e619",
        STATUS_ARRAY_SCHEMA.as_ref().clone(),
    )
}

/// The three wrapper message types of one action, derived from its inner
/// goal, result, and feedback types.
#[derive(Debug, Clone)]
pub struct ActionType {
    name: String,
    goal: MessageType,
    result: MessageType,
    feedback: MessageType,
}

fn wrap_action_msg(action_name: &str, suffix: &str, field: &str, inner: &MessageType) -> MessageType {
    let mut fields = vec![FieldSpec::scalar(
        "header",
        FieldType::Nested(HEADER_SCHEMA.clone()),
    )];

    let tracking_field = if field == "goal" {
        fields.push(FieldSpec::scalar(
            "goal_id",
            FieldType::Nested(GOAL_ID_SCHEMA.clone()),
        ));
        "actionlib_msgs/GoalID goal_id"
    } else {
        fields.push(FieldSpec::scalar(
            "status",
            FieldType::Nested(GOAL_STATUS_SCHEMA.clone()),
        ));
        "actionlib_msgs/GoalStatus status"
    };

    fields.push(FieldSpec::scalar(
        field,
        FieldType::Nested(inner.schema().clone()),
    ));

    MessageType::dynamic(
        format!("{action_name}Action{suffix}"),
        format!(
            "Header header\n{tracking_field}\n{} {field}\n{}",
            inner.name(),
            inner.definition(),
        ),
        MessageSchema::new(fields),
    )
}

impl ActionType {
    pub fn new(
        name: impl Into<String>,
        goal: &MessageType,
        result: &MessageType,
        feedback: &MessageType,
    ) -> Self {
        let name = name.into();

        ActionType {
            goal: wrap_action_msg(&name, "Goal", "goal", goal),
            result: wrap_action_msg(&name, "Result", "result", result),
            feedback: wrap_action_msg(&name, "Feedback", "feedback", feedback),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn goal(&self) -> &MessageType {
        &self.goal
    }

    pub fn result(&self) -> &MessageType {
        &self.result
    }

    pub fn feedback(&self) -> &MessageType {
        &self.feedback
    }
}

pub(crate) fn make_goal_id(id: &str, stamp: Time) -> DynamicMessage {
    let mut msg = DynamicMessage::new(GOAL_ID_SCHEMA.clone());

    msg.set("stamp", Value::Time(stamp))
        .expect("GoalID schema has a stamp field");
    msg.set("id", Value::String(id.to_string()))
        .expect("GoalID schema has an id field");

    msg
}

pub(crate) fn make_header(seq: u32, stamp: Time) -> DynamicMessage {
    let mut msg = DynamicMessage::new(HEADER_SCHEMA.clone());

    msg.set("seq", Value::U32(seq))
        .expect("Header schema has a seq field");
    msg.set("stamp", Value::Time(stamp))
        .expect("Header schema has a stamp field");

    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for code in 0..=9 {
            let status = GoalStatus::from_u8(code).unwrap();
            assert_eq!(status.as_u8(), code);
        }

        assert!(GoalStatus::from_u8(10).is_none());
    }

    #[test]
    fn ack_to_active_is_single_step() {
        let states =
            transition_states(CommState::WaitingForGoalAck, GoalStatus::Active).unwrap();
        assert_eq!(states, vec![CommState::Active]);
    }

    #[test]
    fn preempted_from_pending_passes_through_intermediates() {
        let states = transition_states(CommState::Pending, GoalStatus::Preempted).unwrap();
        assert_eq!(
            states,
            vec![
                CommState::Active,
                CommState::Preempting,
                CommState::WaitingForResult
            ]
        );
    }

    #[test]
    fn regressions_are_illegal() {
        assert!(transition_states(CommState::Active, GoalStatus::Pending).is_err());
        assert!(transition_states(CommState::Done, GoalStatus::Active).is_err());
    }

    #[test]
    fn action_type_derives_wrapper_names() {
        let inner = MessageType::dynamic(
            "demo_msgs/FibonacciGoal",
            "int32 order\n",
            MessageSchema::new(vec![FieldSpec::scalar("order", FieldType::I32)]),
        );

        let action = ActionType::new("demo_msgs/Fibonacci", &inner, &inner, &inner);

        assert_eq!(action.goal().name(), "demo_msgs/FibonacciActionGoal");
        assert_eq!(action.result().name(), "demo_msgs/FibonacciActionResult");
        assert_eq!(
            action.feedback().name(),
            "demo_msgs/FibonacciActionFeedback"
        );
    }
}
