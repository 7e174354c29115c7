use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tracing::{debug, trace, warn};

use crate::{
    action::{
        self, transition_states, ActionError, ActionType, CommState, GoalStatus,
    },
    msg::{DynamicMessage, Value},
    node::{Node, Publisher, Subscriber},
    tcpros::subscription::MessageCallback,
    time::Time,
};

/// Fired on every comm-state change of a goal, on the node's callback
/// loop.
pub type TransitionCallback = Arc<dyn Fn(&ClientGoalHandle) + Send + Sync>;

/// Fired for every feedback message matching a goal.
pub type FeedbackCallback = Arc<dyn Fn(&ClientGoalHandle, DynamicMessage) + Send + Sync>;

struct GoalEntry {
    comm_state: CommState,
    status: GoalStatus,
    status_text: String,
    result: Option<DynamicMessage>,
    transition_cb: Option<TransitionCallback>,
    feedback_cb: Option<FeedbackCallback>,
}

#[derive(Default)]
struct GoalManager {
    goals: HashMap<String, GoalEntry>,
}

impl GoalManager {
    /// Record a status report and return the comm states the goal will
    /// pass through — possibly several when the wire skipped
    /// intermediates. The caller advances the state step by step (via
    /// [`set_comm_state`]) so transition callbacks observe each one.
    ///
    /// [`set_comm_state`]: GoalManager::set_comm_state
    fn plan_status(&mut self, goal_id: &str, status: GoalStatus, text: &str) -> Vec<CommState> {
        let Some(entry) = self.goals.get_mut(goal_id) else {
            return Vec::new();
        };

        entry.status = status;
        entry.status_text = text.to_string();

        if entry.comm_state == CommState::Done {
            return Vec::new();
        }

        match transition_states(entry.comm_state, status) {
            Ok(states) => states,
            Err(illegal) => {
                warn!("Ignoring status update for goal \"{goal_id}\": {illegal}");
                Vec::new()
            }
        }
    }

    fn set_comm_state(&mut self, goal_id: &str, comm_state: CommState) {
        if let Some(entry) = self.goals.get_mut(goal_id) {
            trace!(
                "Goal \"{goal_id}\" comm state: {} -> {comm_state}",
                entry.comm_state
            );
            entry.comm_state = comm_state;
        }
    }

    fn apply_result(&mut self, goal_id: &str, status: GoalStatus, text: &str, result: DynamicMessage) -> bool {
        let Some(entry) = self.goals.get_mut(goal_id) else {
            return false;
        };

        entry.status = status;
        entry.status_text = text.to_string();
        entry.result = Some(result);

        if entry.comm_state == CommState::Done {
            warn!("Received a second result for goal \"{goal_id}\"");
            return false;
        }

        trace!("Goal \"{goal_id}\" comm state: {} -> Done", entry.comm_state);
        entry.comm_state = CommState::Done;
        true
    }
}

/// Tracks one goal submitted through an [`ActionClient`].
#[derive(Clone)]
pub struct ClientGoalHandle {
    goal_id: String,
    manager: Arc<Mutex<GoalManager>>,
    cancel_pub: Publisher,
}

impl ClientGoalHandle {
    pub fn goal_id(&self) -> &str {
        &self.goal_id
    }

    fn entry<T>(&self, read: impl FnOnce(&GoalEntry) -> T) -> Result<T, ActionError> {
        let manager = self.manager.lock().expect("goal manager mutex poisoned");

        manager
            .goals
            .get(&self.goal_id)
            .map(read)
            .ok_or(ActionError::NoGoal)
    }

    pub fn comm_state(&self) -> Result<CommState, ActionError> {
        self.entry(|entry| entry.comm_state)
    }

    pub fn goal_status(&self) -> Result<GoalStatus, ActionError> {
        self.entry(|entry| entry.status)
    }

    pub fn goal_status_text(&self) -> Result<String, ActionError> {
        self.entry(|entry| entry.status_text.clone())
    }

    pub fn result(&self) -> Result<Option<DynamicMessage>, ActionError> {
        self.entry(|entry| entry.result.clone())
    }

    /// Ask the server to cancel this goal. The goal still runs through the
    /// usual status stream before reaching `Done`.
    pub async fn cancel(&self) -> Result<(), ActionError> {
        debug!("Cancelling goal \"{}\"", self.goal_id);

        {
            let mut manager = self.manager.lock().expect("goal manager mutex poisoned");

            if let Some(entry) = manager.goals.get_mut(&self.goal_id) {
                if entry.comm_state != CommState::Done {
                    entry.comm_state = CommState::WaitingForCancelAck;
                }
            }
        }

        let cancel_msg = action::make_goal_id(&self.goal_id, Time::default());
        self.cancel_pub.publish(&cancel_msg).await?;

        Ok(())
    }
}

/// The full action client: five topics and the per-goal comm-state
/// machine. Most applications want [`SimpleActionClient`] instead.
///
/// [`SimpleActionClient`]: crate::action::SimpleActionClient
pub struct ActionClient {
    node: Node,
    action_type: ActionType,
    goal_pub: Publisher,
    cancel_pub: Publisher,
    _status_sub: Subscriber,
    _result_sub: Subscriber,
    _feedback_sub: Subscriber,
    manager: Arc<Mutex<GoalManager>>,
    goal_seq: AtomicU32,
    status_received: Arc<AtomicBool>,
}

impl ActionClient {
    pub async fn new(
        node: &Node,
        action_namespace: &str,
        action_type: &ActionType,
    ) -> Result<Self, ActionError> {
        let ns = node.resolve_name(action_namespace);

        let goal_pub = node
            .advertise(&format!("{ns}/goal"), action_type.goal(), 10, false, false)
            .await?;

        let cancel_pub = node
            .advertise(&format!("{ns}/cancel"), &action::goal_id_type(), 10, false, false)
            .await?;

        let manager = Arc::new(Mutex::new(GoalManager::default()));
        let status_received = Arc::new(AtomicBool::new(false));

        let status_sub = {
            let manager = manager.clone();
            let cancel_pub = cancel_pub.clone();
            let status_received = status_received.clone();

            node.subscribe(
                &format!("{ns}/status"),
                &action::goal_status_array_type(),
                false,
                MessageCallback::message(move |msg| {
                    status_received.store(true, Ordering::Release);
                    Self::on_status_array(&manager, &cancel_pub, &msg);
                }),
            )
            .await?
        };

        let result_sub = {
            let manager = manager.clone();
            let cancel_pub = cancel_pub.clone();

            node.subscribe(
                &format!("{ns}/result"),
                action_type.result(),
                false,
                MessageCallback::message(move |msg| {
                    Self::on_result(&manager, &cancel_pub, &msg);
                }),
            )
            .await?
        };

        let feedback_sub = {
            let manager = manager.clone();
            let cancel_pub = cancel_pub.clone();

            node.subscribe(
                &format!("{ns}/feedback"),
                action_type.feedback(),
                false,
                MessageCallback::message(move |msg| {
                    Self::on_feedback(&manager, &cancel_pub, &msg);
                }),
            )
            .await?
        };

        Ok(ActionClient {
            node: node.clone(),
            action_type: action_type.clone(),
            goal_pub,
            cancel_pub,
            _status_sub: status_sub,
            _result_sub: result_sub,
            _feedback_sub: feedback_sub,
            manager,
            goal_seq: AtomicU32::new(0),
            status_received,
        })
    }

    /// Submit a goal. The send error surfaces to the caller; nothing is
    /// tracked when the publish fails.
    pub async fn send_goal(
        &self,
        goal: DynamicMessage,
        transition_cb: Option<TransitionCallback>,
        feedback_cb: Option<FeedbackCallback>,
        goal_id: Option<String>,
    ) -> Result<ClientGoalHandle, ActionError> {
        let goal_id = goal_id.unwrap_or_else(|| self.node.goal_ids().generate());
        let now = Time::now();

        let mut action_goal = self.goal_pub_message();
        action_goal
            .set("goal_id", Value::Message(action::make_goal_id(&goal_id, now)))
            .map_err(crate::node::NodeError::Codec)?;
        action_goal
            .set("goal", Value::Message(goal))
            .map_err(crate::node::NodeError::Codec)?;

        {
            let mut manager = self.manager.lock().expect("goal manager mutex poisoned");

            manager.goals.insert(
                goal_id.clone(),
                GoalEntry {
                    comm_state: CommState::WaitingForGoalAck,
                    status: GoalStatus::Pending,
                    status_text: String::new(),
                    result: None,
                    transition_cb,
                    feedback_cb,
                },
            );
        }

        if let Err(e) = self.goal_pub.publish(&action_goal).await {
            let mut manager = self.manager.lock().expect("goal manager mutex poisoned");
            manager.goals.remove(&goal_id);
            return Err(e.into());
        }

        debug!("Sent goal \"{goal_id}\"");

        Ok(ClientGoalHandle {
            goal_id,
            manager: self.manager.clone(),
            cancel_pub: self.cancel_pub.clone(),
        })
    }

    fn goal_pub_message(&self) -> DynamicMessage {
        let seq = self.goal_seq.fetch_add(1, Ordering::AcqRel);

        let mut msg = self.action_type.goal().new_message();

        let _ = msg.set(
            "header",
            Value::Message(action::make_header(seq, Time::now())),
        );

        msg
    }

    /// Stop tracking a goal client-side. The server is not informed.
    pub fn forget_goal(&self, goal_id: &str) {
        let mut manager = self.manager.lock().expect("goal manager mutex poisoned");
        manager.goals.remove(goal_id);
    }

    /// Ask the server to cancel every goal it knows about.
    pub async fn cancel_all_goals(&self) -> Result<(), ActionError> {
        // An empty ID with a zero stamp is the protocol's "cancel
        // everything" request.
        let cancel_msg = action::make_goal_id("", Time::default());
        self.cancel_pub.publish(&cancel_msg).await?;
        Ok(())
    }

    /// Ask the server to cancel every goal submitted before `stamp`.
    pub async fn cancel_goals_before(&self, stamp: Time) -> Result<(), ActionError> {
        let cancel_msg = action::make_goal_id("", stamp);
        self.cancel_pub.publish(&cancel_msg).await?;
        Ok(())
    }

    /// Wait until the server's status stream is visible. Zero timeout
    /// means wait forever.
    pub async fn wait_for_server(&self, timeout: Duration) -> bool {
        let deadline = (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout);

        loop {
            if self.status_received.load(Ordering::Acquire) {
                return true;
            }

            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return false;
                }
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn handle_for(
        manager: &Arc<Mutex<GoalManager>>,
        cancel_pub: &Publisher,
        goal_id: &str,
    ) -> ClientGoalHandle {
        ClientGoalHandle {
            goal_id: goal_id.to_string(),
            manager: manager.clone(),
            cancel_pub: cancel_pub.clone(),
        }
    }

    fn on_status_array(
        manager: &Arc<Mutex<GoalManager>>,
        cancel_pub: &Publisher,
        msg: &DynamicMessage,
    ) {
        let Some(status_list) = msg.get("status_list").and_then(Value::as_array) else {
            warn!("Status array message is missing its status_list");
            return;
        };

        for status_msg in status_list.iter().filter_map(Value::as_message) {
            let Some((goal_id, status, text)) = parse_goal_status(status_msg) else {
                warn!("Malformed GoalStatus entry in status array");
                continue;
            };

            let (passed_states, transition_cb) = {
                let mut manager_guard =
                    manager.lock().expect("goal manager mutex poisoned");

                let passed = manager_guard.plan_status(&goal_id, status, &text);
                let cb = manager_guard
                    .goals
                    .get(&goal_id)
                    .and_then(|entry| entry.transition_cb.clone());

                (passed, cb)
            };

            let handle = Self::handle_for(manager, cancel_pub, &goal_id);

            // Advance one state at a time so callbacks see intermediates
            // the wire skipped.
            for comm_state in passed_states {
                manager
                    .lock()
                    .expect("goal manager mutex poisoned")
                    .set_comm_state(&goal_id, comm_state);

                if let Some(transition_cb) = &transition_cb {
                    transition_cb(&handle);
                }
            }
        }
    }

    fn on_result(
        manager: &Arc<Mutex<GoalManager>>,
        cancel_pub: &Publisher,
        msg: &DynamicMessage,
    ) {
        let Some(status_msg) = msg.get("status").and_then(Value::as_message) else {
            warn!("Result message is missing its status");
            return;
        };

        let Some((goal_id, status, text)) = parse_goal_status(status_msg) else {
            warn!("Malformed GoalStatus in result message");
            return;
        };

        let Some(result) = msg.get("result").and_then(Value::as_message) else {
            warn!("Result message is missing its result body");
            return;
        };

        let (transitioned, transition_cb) = {
            let mut manager_guard = manager.lock().expect("goal manager mutex poisoned");

            let transitioned =
                manager_guard.apply_result(&goal_id, status, &text, result.clone());
            let cb = manager_guard
                .goals
                .get(&goal_id)
                .and_then(|entry| entry.transition_cb.clone());

            (transitioned, cb)
        };

        if transitioned {
            if let Some(transition_cb) = transition_cb {
                let handle = Self::handle_for(manager, cancel_pub, &goal_id);
                transition_cb(&handle);
            }
        }
    }

    fn on_feedback(
        manager: &Arc<Mutex<GoalManager>>,
        cancel_pub: &Publisher,
        msg: &DynamicMessage,
    ) {
        let Some(status_msg) = msg.get("status").and_then(Value::as_message) else {
            return;
        };

        let Some((goal_id, _, _)) = parse_goal_status(status_msg) else {
            return;
        };

        let Some(feedback) = msg.get("feedback").and_then(Value::as_message) else {
            return;
        };

        let feedback_cb = {
            let manager_guard = manager.lock().expect("goal manager mutex poisoned");

            manager_guard
                .goals
                .get(&goal_id)
                .and_then(|entry| entry.feedback_cb.clone())
        };

        if let Some(feedback_cb) = feedback_cb {
            let handle = Self::handle_for(manager, cancel_pub, &goal_id);
            feedback_cb(&handle, feedback.clone());
        }
    }
}

fn parse_goal_status(status_msg: &DynamicMessage) -> Option<(String, GoalStatus, String)> {
    let goal_id = status_msg
        .get("goal_id")
        .and_then(Value::as_message)?
        .get("id")
        .and_then(Value::as_str)?
        .to_string();

    let status = GoalStatus::from_u8(status_msg.get("status").and_then(Value::as_u8)?)?;

    let text = status_msg
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Some((goal_id, status, text))
}
