// slotwatch: unattended appointment-slot watcher core
//
// Browser session lifecycle, failure recovery, identity rotation and the
// detect-and-claim polling loop. Browsers, CAPTCHA solving and chat delivery
// are consumed through the traits in `page`, `captcha` and `notify`.

pub mod captcha;
pub mod config;
pub mod control;
pub mod error;
pub mod identity;
pub mod notify;
pub mod orchestrator;
pub mod page;
pub mod record;
pub mod recovery;
pub mod rotation;
pub mod session;
pub mod status;
pub mod stop;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use captcha::{CaptchaSolver, NoSolver};
pub use config::{ConfigUpdate, OrchestratorConfig, Settings};
pub use control::{CollaboratorBuilder, ControlError, ControlRequest, ControlResponse, Controller};
pub use error::{NotifyError, PageError, Result, WatchError};
pub use identity::{Identity, IdentityId};
pub use notify::{Notifications, Notifier};
pub use orchestrator::{Collaborators, Orchestrator, OrchestratorHandle};
pub use page::{Action, ActionOutput, BrowserFactory, ElementDescriptor, ElementHandle, FormField, PageDriver, PageState, SelectOption};
pub use recovery::{FailureKind, RecoveryController, RecoveryOutcome, RecoveryPolicy};
pub use session::{Session, SessionOptions, SessionState};
pub use status::StatusSnapshot;
