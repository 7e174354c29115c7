use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::{
    action::{
        ActionClient, ActionError, ActionType, ClientGoalHandle, CommState, GoalStatus,
        TransitionCallback,
    },
    msg::DynamicMessage,
    node::Node,
};

/// The user-facing projection of a goal's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleGoalState {
    Pending,
    Active,
    Done,
}

pub type DoneCallback = Arc<dyn Fn(GoalStatus, Option<DynamicMessage>) + Send + Sync>;
pub type ActiveCallback = Arc<dyn Fn() + Send + Sync>;
pub type SimpleFeedbackCallback = Arc<dyn Fn(DynamicMessage) + Send + Sync>;

struct SimpleState {
    simple_state: Mutex<SimpleGoalState>,
    goal_handle: Mutex<Option<ClientGoalHandle>>,
    done_cb: Mutex<Option<DoneCallback>>,
    active_cb: Mutex<Option<ActiveCallback>>,
    feedback_cb: Mutex<Option<SimpleFeedbackCallback>>,
    done_tx: mpsc::Sender<()>,
}

impl SimpleState {
    fn set_simple_state(&self, to: SimpleGoalState) {
        let mut state = self.simple_state.lock().expect("simple state mutex poisoned");
        debug!("Simple state transition: {:?} -> {to:?}", *state);
        *state = to;
    }

    fn simple_state(&self) -> SimpleGoalState {
        *self.simple_state.lock().expect("simple state mutex poisoned")
    }

    fn send_done(&self) {
        // The buffer keeps the transition handler from ever blocking when
        // nobody is waiting on the result.
        if self.done_tx.try_send(()).is_err() {
            error!("Failed to send done notification, channel full");
        }
    }

    /// The spec'd three-state projection of comm-state changes. Anything
    /// that does not fit the table is logged and leaves the state alone.
    fn handle_transition(&self, handle: &ClientGoalHandle) {
        let comm_state = match handle.comm_state() {
            Ok(comm_state) => comm_state,
            Err(e) => {
                error!("Error getting comm state: {e}");
                return;
            }
        };

        let simple_state = self.simple_state();

        match comm_state {
            CommState::Active | CommState::Preempting => match simple_state {
                SimpleGoalState::Pending => {
                    self.set_simple_state(SimpleGoalState::Active);

                    let active_cb = self.active_cb.lock().expect("callback mutex poisoned");
                    if let Some(active_cb) = active_cb.as_ref() {
                        active_cb();
                    }
                }
                SimpleGoalState::Active => {}
                SimpleGoalState::Done => {
                    error!(
                        "Received comm state {comm_state} when the goal is already done"
                    );
                }
            },

            CommState::Recalling => {
                if simple_state != SimpleGoalState::Pending {
                    error!("Received comm state {comm_state} in simple state {simple_state:?}");
                }
            }

            CommState::Done => match simple_state {
                SimpleGoalState::Pending | SimpleGoalState::Active => {
                    self.set_simple_state(SimpleGoalState::Done);
                    self.send_done();

                    let done_cb = self.done_cb.lock().expect("callback mutex poisoned");
                    if let Some(done_cb) = done_cb.as_ref() {
                        let status = handle.goal_status().unwrap_or(GoalStatus::Lost);
                        let result = handle.result().unwrap_or(None);
                        done_cb(status, result);
                    }
                }
                SimpleGoalState::Done => {
                    error!("Received done twice for the same goal");
                }
            },

            _ => {}
        }
    }

    fn handle_feedback(&self, handle: &ClientGoalHandle, feedback: DynamicMessage) {
        // Feedback for goals we stopped tracking is silently dropped.
        let tracked = {
            let goal_handle = self.goal_handle.lock().expect("goal handle mutex poisoned");
            goal_handle
                .as_ref()
                .is_some_and(|current| current.goal_id() == handle.goal_id())
        };

        if !tracked {
            return;
        }

        let feedback_cb = self.feedback_cb.lock().expect("callback mutex poisoned");
        if let Some(feedback_cb) = feedback_cb.as_ref() {
            feedback_cb(feedback);
        }
    }
}

/// Wraps [`ActionClient`] into the three-state `{Pending, Active, Done}`
/// view, with one tracked goal at a time.
pub struct SimpleActionClient {
    ac: ActionClient,
    state: Arc<SimpleState>,
    done_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl SimpleActionClient {
    pub async fn new(
        node: &Node,
        action_namespace: &str,
        action_type: &ActionType,
    ) -> Result<Self, ActionError> {
        let ac = ActionClient::new(node, action_namespace, action_type).await?;
        let (done_tx, done_rx) = mpsc::channel(10);

        Ok(SimpleActionClient {
            ac,
            state: Arc::new(SimpleState {
                simple_state: Mutex::new(SimpleGoalState::Done),
                goal_handle: Mutex::new(None),
                done_cb: Mutex::new(None),
                active_cb: Mutex::new(None),
                feedback_cb: Mutex::new(None),
                done_tx,
            }),
            done_rx: tokio::sync::Mutex::new(done_rx),
        })
    }

    /// Access to the wrapped full client.
    pub fn action_client(&self) -> &ActionClient {
        &self.ac
    }

    /// Wait until the action server's status stream is visible.
    pub async fn wait_for_server(&self, timeout: Duration) -> bool {
        self.ac.wait_for_server(timeout).await
    }

    /// Submit a goal, dropping any previously tracked one.
    ///
    /// The callbacks are each optional: `on_done(status, result)` fires
    /// once the goal reaches a terminal status, `on_active()` when the
    /// server starts it, `on_feedback(msg)` for every feedback message.
    pub async fn send_goal(
        &self,
        goal: DynamicMessage,
        on_done: Option<DoneCallback>,
        on_active: Option<ActiveCallback>,
        on_feedback: Option<SimpleFeedbackCallback>,
    ) -> Result<(), ActionError> {
        self.stop_tracking_goal();

        // Done signals from an abandoned goal must not satisfy waits on
        // this one.
        {
            let mut done_rx = self.done_rx.lock().await;
            while done_rx.try_recv().is_ok() {}
        }

        *self.state.done_cb.lock().expect("callback mutex poisoned") = on_done;
        *self.state.active_cb.lock().expect("callback mutex poisoned") = on_active;
        *self.state.feedback_cb.lock().expect("callback mutex poisoned") = on_feedback;

        self.state.set_simple_state(SimpleGoalState::Pending);

        let transition_cb: TransitionCallback = {
            let state = self.state.clone();
            Arc::new(move |handle: &ClientGoalHandle| state.handle_transition(handle))
        };

        let feedback_cb: crate::action::FeedbackCallback = {
            let state = self.state.clone();
            Arc::new(move |handle: &ClientGoalHandle, feedback: DynamicMessage| {
                state.handle_feedback(handle, feedback)
            })
        };

        let handle = self
            .ac
            .send_goal(goal, Some(transition_cb), Some(feedback_cb), None)
            .await?;

        *self
            .state
            .goal_handle
            .lock()
            .expect("goal handle mutex poisoned") = Some(handle);

        Ok(())
    }

    /// Submit a goal and block until it finishes, cancelling when
    /// `exec_timeout` expires. Zero timeouts mean wait forever.
    pub async fn send_goal_and_wait(
        &self,
        goal: DynamicMessage,
        exec_timeout: Duration,
        preempt_timeout: Duration,
    ) -> Result<GoalStatus, ActionError> {
        self.send_goal(goal, None, None, None).await?;

        if !self.wait_for_result(exec_timeout).await {
            debug!("Cancelling goal");
            self.cancel_goal().await?;

            if self.wait_for_result(preempt_timeout).await {
                debug!("Preempt finished within the specified timeout");
            } else {
                debug!("Preempt did not finish within the specified timeout");
            }
        }

        self.get_state()
    }

    /// Block until the tracked goal reaches `Done` or the timeout expires.
    /// A zero timeout waits forever. Returns whether the goal is done.
    pub async fn wait_for_result(&self, timeout: Duration) -> bool {
        if self
            .state
            .goal_handle
            .lock()
            .expect("goal handle mutex poisoned")
            .is_none()
        {
            error!("Called wait_for_result when no goal exists");
            return false;
        }

        let deadline = (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout);
        let mut done_rx = self.done_rx.lock().await;

        loop {
            tokio::select! {
                _ = done_rx.recv() => break,
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }

            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
            }
        }

        self.state.simple_state() == SimpleGoalState::Done
    }

    /// The tracked goal's result, if one has arrived.
    pub fn get_result(&self) -> Result<Option<DynamicMessage>, ActionError> {
        let goal_handle = self
            .state
            .goal_handle
            .lock()
            .expect("goal handle mutex poisoned");

        goal_handle.as_ref().ok_or(ActionError::NoGoal)?.result()
    }

    /// The tracked goal's latest status, projected so that transitional
    /// cancel statuses read as their steady-state counterparts:
    /// `Preempting` reports as `Active` and `Recalling` as `Pending`.
    pub fn get_state(&self) -> Result<GoalStatus, ActionError> {
        let status = {
            let goal_handle = self
                .state
                .goal_handle
                .lock()
                .expect("goal handle mutex poisoned");

            goal_handle
                .as_ref()
                .ok_or(ActionError::NoGoal)?
                .goal_status()?
        };

        Ok(match status {
            GoalStatus::Preempting => GoalStatus::Active,
            GoalStatus::Recalling => GoalStatus::Pending,
            status => status,
        })
    }

    /// The human-readable text attached to the latest status.
    pub fn get_goal_status_text(&self) -> Result<String, ActionError> {
        let goal_handle = self
            .state
            .goal_handle
            .lock()
            .expect("goal handle mutex poisoned");

        goal_handle
            .as_ref()
            .ok_or(ActionError::NoGoal)?
            .goal_status_text()
    }

    /// Cancel the tracked goal. A no-op when nothing is tracked.
    pub async fn cancel_goal(&self) -> Result<(), ActionError> {
        let handle = {
            let goal_handle = self
                .state
                .goal_handle
                .lock()
                .expect("goal handle mutex poisoned");

            goal_handle.clone()
        };

        match handle {
            Some(handle) => handle.cancel().await,
            None => Ok(()),
        }
    }

    /// Cancel every goal the server knows about.
    pub async fn cancel_all_goals(&self) -> Result<(), ActionError> {
        self.ac.cancel_all_goals().await
    }

    /// Drop the tracked goal without telling the server.
    pub fn stop_tracking_goal(&self) {
        let previous = self
            .state
            .goal_handle
            .lock()
            .expect("goal handle mutex poisoned")
            .take();

        if let Some(previous) = previous {
            self.ac.forget_goal(previous.goal_id());
        }
    }
}

impl Drop for SimpleActionClient {
    fn drop(&mut self) {
        self.stop_tracking_goal();
    }
}
