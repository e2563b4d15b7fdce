//! Acting-user context for action execution.
//!
//! The scheduler scopes an action's future to the job owner when no user is
//! already active. Actions read it with [`acting_user`].

use std::future::Future;

tokio::task_local! {
    static ACTING_USER: String;
}

/// The user the current task is acting as, if any.
pub fn acting_user() -> Option<String> {
    ACTING_USER.try_with(|user| user.clone()).ok()
}

/// Run `fut` acting as `user`.
pub async fn act_as<F: Future>(user: String, fut: F) -> F::Output {
    ACTING_USER.scope(user, fut).await
}
