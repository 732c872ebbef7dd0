//! Channel adapters: inbound normalization and outbound delivery.

pub mod channel;
pub mod cursor;
pub mod imessage;
pub mod imessage_sender;
pub mod telegram;

pub use channel::*;
pub use cursor::CursorFile;
pub use imessage::{ChatDbReader, spawn_imessage_poller};
pub use imessage_sender::IMessageSender;
pub use telegram::{TelegramBot, spawn_telegram_channel};
