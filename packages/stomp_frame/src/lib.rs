//! STOMP 1.2 text frame codec.
//!
//! Wire format (one frame):
//!
//! ```text
//! COMMAND\n
//! header:value\n
//! ...\n
//! \n
//! body\0
//! ```
//!
//! A lone end-of-line between frames is a heart-beat and carries no frame.
//!
//! # Example
//!
//! ```
//! use stomp_frame::{Command, Frame};
//!
//! let frame = Frame::send("/app/chat.sendMessage", r#"{"content":"hi"}"#);
//! let wire = frame.encode();
//! let back = stomp_frame::decode(&wire).unwrap();
//! assert_eq!(back.command, Command::Send);
//! assert_eq!(back.get("destination"), Some("/app/chat.sendMessage"));
//! ```

pub mod command;
pub mod error;
pub mod frame;

pub use command::Command;
pub use error::FrameError;
pub use frame::{Frame, decode, decode_all, is_heartbeat};
