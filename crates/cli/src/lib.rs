//! slotwatch binary support: concrete collaborators (Chrome over DevTools,
//! tesseract, Telegram), the local control channel and the command handlers.

pub mod captcha;
pub mod chrome;
pub mod cli;
pub mod commands;
pub mod control;
pub mod error;
pub mod logging;
pub mod paths;
pub mod telegram;

#[cfg(test)]
pub(crate) mod fixtures;
#[cfg(test)]
pub(crate) mod test_http;
