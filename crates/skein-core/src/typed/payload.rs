use serde::Serialize;
use serde::de::DeserializeOwned;

/// Binds a payload type to the task type it is stored under.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendReminder {
///     chat_id: i64,
///     text: String,
/// }
///
/// impl TaskPayload for SendReminder {
///     const TASK_TYPE: &'static str = "reminders.send";
/// }
/// ```
pub trait TaskPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TASK_TYPE: &'static str;
}
