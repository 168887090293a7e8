//! IRC numeric replies.
//!
//! The subset of RFC 2812 numerics the network emits. Numerics are formatted
//! as three-digit command strings, so `Response::RplWelcome` serializes as
//! `001`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A server numeric reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Response {
    /// 001 - welcome to the network
    RplWelcome = 1,
    /// 002 - your host
    RplYourHost = 2,
    /// 003 - server creation date
    RplCreated = 3,
    /// 004 - server name, version, supported modes
    RplMyInfo = 4,
    /// 005 - supported features
    RplIsupport = 5,

    /// 221 - user mode query reply
    RplUmodeIs = 221,
    /// 301 - target is away
    RplAway = 301,
    /// 303 - ISON reply
    RplIson = 303,
    /// 305 - no longer away
    RplUnaway = 305,
    /// 306 - now away
    RplNowAway = 306,
    /// 311 - WHOIS user info
    RplWhoisUser = 311,
    /// 312 - WHOIS server info
    RplWhoisServer = 312,
    /// 313 - WHOIS operator flag
    RplWhoisOperator = 313,
    /// 315 - end of WHO
    RplEndOfWho = 315,
    /// 317 - WHOIS idle time
    RplWhoisIdle = 317,
    /// 318 - end of WHOIS
    RplEndOfWhois = 318,
    /// 319 - WHOIS channel list
    RplWhoisChannels = 319,
    /// 322 - LIST entry
    RplList = 322,
    /// 323 - end of LIST
    RplListEnd = 323,
    /// 324 - channel mode query reply
    RplChannelModeIs = 324,
    /// 331 - no topic set
    RplNoTopic = 331,
    /// 332 - channel topic
    RplTopic = 332,
    /// 333 - who set the topic, and when
    RplTopicWhoTime = 333,
    /// 341 - INVITE confirmation
    RplInviting = 341,
    /// 352 - WHO entry
    RplWhoReply = 352,
    /// 353 - NAMES entry
    RplNamreply = 353,
    /// 366 - end of NAMES
    RplEndOfNames = 366,
    /// 367 - ban list entry
    RplBanList = 367,
    /// 368 - end of ban list
    RplEndOfBanList = 368,
    /// 381 - you are now an operator
    RplYoureOper = 381,

    /// 401 - no such nick
    ErrNoSuchNick = 401,
    /// 403 - no such channel
    ErrNoSuchChannel = 403,
    /// 404 - cannot send to channel
    ErrCannotSendToChan = 404,
    /// 405 - too many channels
    ErrTooManyChannels = 405,
    /// 409 - no origin given (PING)
    ErrNoOrigin = 409,
    /// 411 - no recipient
    ErrNoRecipient = 411,
    /// 412 - no text to send
    ErrNoTextToSend = 412,
    /// 421 - unknown command
    ErrUnknownCommand = 421,
    /// 422 - no MOTD
    ErrNoMotd = 422,
    /// 431 - no nickname given
    ErrNoNicknameGiven = 431,
    /// 432 - erroneous nickname
    ErrErroneusNickname = 432,
    /// 433 - nickname in use
    ErrNicknameInUse = 433,
    /// 441 - target not on channel
    ErrUserNotInChannel = 441,
    /// 442 - you're not on that channel
    ErrNotOnChannel = 442,
    /// 443 - target already on channel
    ErrUserOnChannel = 443,
    /// 451 - not registered
    ErrNotRegistered = 451,
    /// 461 - not enough parameters
    ErrNeedMoreParams = 461,
    /// 462 - already registered
    ErrAlreadyRegistred = 462,
    /// 464 - password mismatch
    ErrPasswdMismatch = 464,
    /// 471 - channel is full (+l)
    ErrChannelIsFull = 471,
    /// 472 - unknown channel mode character
    ErrUnknownMode = 472,
    /// 473 - invite-only channel (+i)
    ErrInviteOnlyChan = 473,
    /// 474 - banned from channel (+b)
    ErrBannedFromChan = 474,
    /// 475 - bad channel key (+k)
    ErrBadChannelKey = 475,
    /// 481 - no oper privileges
    ErrNoPrivileges = 481,
    /// 482 - channel operator privileges needed
    ErrChanOpPrivsNeeded = 482,
    /// 491 - no O-line for your host
    ErrNoOperHost = 491,
    /// 501 - unknown user mode flag
    ErrUmodeUnknownFlag = 501,
    /// 502 - cannot change mode for other users
    ErrUsersDontMatch = 502,
}

impl Response {
    /// The numeric code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether this numeric signals an error.
    pub fn is_error(self) -> bool {
        self.code() >= 400
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_three_digits() {
        assert_eq!(Response::RplWelcome.to_string(), "001");
        assert_eq!(Response::RplUmodeIs.to_string(), "221");
        assert_eq!(Response::ErrNicknameInUse.to_string(), "433");
    }

    #[test]
    fn test_is_error() {
        assert!(Response::ErrUnknownCommand.is_error());
        assert!(!Response::RplTopic.is_error());
    }
}
