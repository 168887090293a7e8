//! # robust-proto
//!
//! A library for parsing and serializing IRC protocol messages, used by the
//! robustircd replicated state machine.
//!
//! Everything in this crate is deterministic: parsing and formatting depend
//! only on the input bytes, so the same committed log entry produces the same
//! reply bytes on every node of the network.
//!
//! ## Quick Start
//!
//! ```rust
//! use robust_proto::Message;
//!
//! let msg: Message = ":nick!user@host PRIVMSG #channel :Hello!".parse().unwrap();
//! assert_eq!(msg.command, "PRIVMSG");
//! assert_eq!(msg.params, vec!["#channel", "Hello!"]);
//! ```

pub mod casemap;
pub mod chan;
pub mod error;
pub mod message;
pub mod nick;
pub mod prefix;
pub mod response;
pub mod util;

pub use self::casemap::{irc_eq, irc_lower_char, irc_to_lower};
pub use self::chan::ChannelExt;
pub use self::error::ParseError;
pub use self::message::{Message, MAX_LINE_LEN, MAX_PARAMS};
pub use self::nick::{NickExt, MAX_NICK_LEN};
pub use self::prefix::Prefix;
pub use self::response::Response;
pub use self::util::wildcard_match;
