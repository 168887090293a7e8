//! The command interpreter.
//!
//! `process_message` is a pure step function over the IRC state: the only
//! inputs are the state itself, one committed record's line, and the record
//! timestamp. Anything nondeterministic (wall clock, randomness, unordered
//! iteration) is banned here, because every node must produce byte-identical
//! replies for the same log.
//!
//! Failures are absorbed: a bad line or an illegal command produces a numeric
//! (or a NOTICE) to the originating session and leaves the state untouched
//! apart from last-activity.

use std::collections::BTreeSet;

use robust_proto::{
    irc_to_lower, wildcard_match, ChannelExt, Message, NickExt, Prefix, Response, MAX_LINE_LEN,
};

use super::channel::{Channel, ListEntry, MemberModes, Topic};
use super::session::{Phase, SessionId};
use super::{IrcServer, Reply};

/// Version string reported in the welcome burst; identical on every node
/// running the same build, which the canary upgrade check relies on.
const SERVER_VERSION: &str = concat!("robustircd-", env!("CARGO_PKG_VERSION"));

impl IrcServer {
    /// Interpret one IRC line from a session.
    ///
    /// `now` is the record timestamp in nanoseconds; it is the only clock
    /// this function may observe.
    pub fn process_message(&mut self, id: SessionId, line: &str, now: i64) -> Vec<Reply> {
        let mut out = Vec::new();

        if !self.sessions.contains_key(&id) {
            // SessionUnknown is absorbed: the session was deleted between
            // propose and apply.
            return out;
        }
        self.sessions.get_mut(&id).expect("checked above").last_activity = now;

        if self.sessions[&id].phase == Phase::Quit {
            let warning = Message::new("NOTICE", [self.sessions[&id].nick_or_star()])
                .with_trailing("Your session is closed, the command was discarded")
                .with_prefix(self.server_prefix());
            out.push(Reply::to_session(id, warning));
            return out;
        }

        let msg: Message = match line.parse() {
            Ok(msg) => msg,
            Err(e) => {
                let notice = Message::new("NOTICE", [self.sessions[&id].nick_or_star()])
                    .with_trailing(format!("Unable to parse your command: {}", e))
                    .with_prefix(self.server_prefix());
                out.push(Reply::to_session(id, notice));
                return out;
            }
        };

        if !self.sessions[&id].registered()
            && !matches!(
                msg.command.as_str(),
                "PASS" | "NICK" | "USER" | "QUIT" | "PING" | "PONG" | "CAP"
            )
        {
            self.push_numeric(&mut out, id, Response::ErrNotRegistered, vec![
                "You have not registered".to_string(),
            ]);
            return out;
        }

        match msg.command.as_str() {
            "NICK" => self.cmd_nick(id, &msg, &mut out),
            "USER" => self.cmd_user(id, &msg, &mut out),
            "PASS" => self.cmd_pass(id, &msg, &mut out),
            "PING" => self.cmd_ping(id, &msg, &mut out),
            "PONG" => {}
            "CAP" => self.cmd_cap(id, &msg, &mut out),
            "JOIN" => self.cmd_join(id, &msg, &mut out),
            "PART" => self.cmd_part(id, &msg, &mut out),
            "QUIT" => self.cmd_quit(id, &msg, &mut out),
            "PRIVMSG" => self.cmd_privmsg(id, &msg, false, &mut out),
            "NOTICE" => self.cmd_privmsg(id, &msg, true, &mut out),
            "TOPIC" => self.cmd_topic(id, &msg, now, &mut out),
            "MODE" => self.cmd_mode(id, &msg, now, &mut out),
            "NAMES" => self.cmd_names(id, &msg, &mut out),
            "WHO" => self.cmd_who(id, &msg, &mut out),
            "WHOIS" => self.cmd_whois(id, &msg, now, &mut out),
            "KICK" => self.cmd_kick(id, &msg, &mut out),
            "INVITE" => self.cmd_invite(id, &msg, &mut out),
            "LIST" => self.cmd_list(id, &msg, &mut out),
            "ISON" => self.cmd_ison(id, &msg, &mut out),
            "AWAY" => self.cmd_away(id, &msg, &mut out),
            "OPER" => self.cmd_oper(id, &msg, &mut out),
            "KILL" => self.cmd_kill(id, &msg, now, &mut out),
            verb => {
                self.push_numeric(&mut out, id, Response::ErrUnknownCommand, vec![
                    verb.to_string(),
                    "Unknown command".to_string(),
                ]);
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Reply helpers
    // ------------------------------------------------------------------

    fn server_prefix(&self) -> Prefix {
        Prefix::ServerName(self.server_name.clone())
    }

    fn push_numeric(
        &self,
        out: &mut Vec<Reply>,
        id: SessionId,
        response: Response,
        params: Vec<String>,
    ) {
        let nick = self
            .sessions
            .get(&id)
            .map(|s| s.nick_or_star().to_string())
            .unwrap_or_else(|| "*".to_string());
        let mut all = vec![nick];
        all.extend(params);
        out.push(Reply::to_session(id, Message::numeric(&self.server_name, response, all)));
    }

    fn push_need_more_params(&self, out: &mut Vec<Reply>, id: SessionId, verb: &str) {
        self.push_numeric(out, id, Response::ErrNeedMoreParams, vec![
            verb.to_string(),
            "Not enough parameters".to_string(),
        ]);
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    fn cmd_nick(&mut self, id: SessionId, msg: &Message, out: &mut Vec<Reply>) {
        let attempt = match msg.param(0) {
            Some(nick) if !nick.is_empty() => nick.to_string(),
            _ => {
                self.push_numeric(out, id, Response::ErrNoNicknameGiven, vec![
                    "No nickname given".to_string(),
                ]);
                return;
            }
        };
        if !attempt.as_str().is_valid_nick() {
            self.push_numeric(out, id, Response::ErrErroneusNickname, vec![
                attempt,
                "Erroneous nickname".to_string(),
            ]);
            return;
        }
        if let Some(owner) = self.session_by_nick(&attempt) {
            if owner.id != id {
                self.push_numeric(out, id, Response::ErrNicknameInUse, vec![
                    attempt,
                    "Nickname is already in use".to_string(),
                ]);
                return;
            }
        }

        let (old_prefix, was_registered) = {
            let session = &self.sessions[&id];
            (session.prefix(), session.registered())
        };
        {
            let session = self.sessions.get_mut(&id).expect("session exists");
            session.nick = attempt.clone();
            if session.phase == Phase::Unregistered || session.phase == Phase::Authenticating {
                session.phase = Phase::Registering;
            }
        }

        if was_registered {
            let mut interested = self.channel_mates(id);
            interested.insert(id);
            out.push(Reply {
                msg: Message::new("NICK", [attempt]).with_prefix(old_prefix),
                interested,
            });
        } else {
            self.maybe_complete_registration(id, out);
        }
    }

    fn cmd_user(&mut self, id: SessionId, msg: &Message, out: &mut Vec<Reply>) {
        if self.sessions[&id].registered() {
            self.push_numeric(out, id, Response::ErrAlreadyRegistred, vec![
                "Unauthorized command (already registered)".to_string(),
            ]);
            return;
        }
        if msg.params.len() < 4 {
            self.push_need_more_params(out, id, "USER");
            return;
        }
        {
            let session = self.sessions.get_mut(&id).expect("session exists");
            session.username = msg.params[0].clone();
            session.realname = msg.params[3].clone();
            if session.phase == Phase::Unregistered || session.phase == Phase::Authenticating {
                session.phase = Phase::Registering;
            }
        }
        self.maybe_complete_registration(id, out);
    }

    fn cmd_pass(&mut self, id: SessionId, msg: &Message, out: &mut Vec<Reply>) {
        if self.sessions[&id].registered() {
            self.push_numeric(out, id, Response::ErrAlreadyRegistred, vec![
                "Unauthorized command (already registered)".to_string(),
            ]);
            return;
        }
        let password = match msg.param(0) {
            Some(password) => password.to_string(),
            None => {
                self.push_need_more_params(out, id, "PASS");
                return;
            }
        };
        let session = self.sessions.get_mut(&id).expect("session exists");
        session.password = password;
        if session.phase == Phase::Unregistered {
            session.phase = Phase::Authenticating;
        }
    }

    /// Capability negotiation. The network offers no capabilities, so LS
    /// answers with an empty set and every REQ is refused; bridges fall back
    /// to plain RFC 1459 behavior.
    fn cmd_cap(&mut self, id: SessionId, msg: &Message, out: &mut Vec<Reply>) {
        let nick = self.sessions[&id].nick_or_star().to_string();
        match msg.param(0).unwrap_or("").to_ascii_uppercase().as_str() {
            "LS" | "LIST" => {
                out.push(Reply::to_session(
                    id,
                    Message::new("CAP", [nick, "LS".to_string()])
                        .with_trailing("")
                        .with_prefix(self.server_prefix()),
                ));
            }
            "REQ" => {
                let requested = msg.param(1).unwrap_or("").to_string();
                out.push(Reply::to_session(
                    id,
                    Message::new("CAP", [nick, "NAK".to_string()])
                        .with_trailing(requested)
                        .with_prefix(self.server_prefix()),
                ));
            }
            // END and anything else need no reply.
            _ => {}
        }
    }

    fn cmd_ping(&mut self, id: SessionId, msg: &Message, out: &mut Vec<Reply>) {
        let token = match msg.param(0) {
            Some(token) => token.to_string(),
            None => {
                self.push_numeric(out, id, Response::ErrNoOrigin, vec![
                    "No origin specified".to_string(),
                ]);
                return;
            }
        };
        let pong = Message::new("PONG", [self.server_name.clone()])
            .with_trailing(token)
            .with_prefix(self.server_prefix());
        out.push(Reply::to_session(id, pong));
    }

    /// Emit the welcome burst once both NICK and USER arrived.
    fn maybe_complete_registration(&mut self, id: SessionId, out: &mut Vec<Reply>) {
        {
            let session = &self.sessions[&id];
            if session.registered() || session.nick.is_empty() || session.username.is_empty() {
                return;
            }
        }
        self.sessions.get_mut(&id).expect("session exists").phase = Phase::Registered;

        let nick = self.sessions[&id].nick.clone();
        let created = chrono::DateTime::from_timestamp_nanos(self.server_created)
            .format("%a %b %e %Y at %H:%M:%S UTC")
            .to_string();

        self.push_numeric(out, id, Response::RplWelcome, vec![format!(
            "Welcome to the {} IRC network, {}",
            self.server_name, nick
        )]);
        self.push_numeric(out, id, Response::RplYourHost, vec![format!(
            "Your host is {}, running version {}",
            self.server_name, SERVER_VERSION
        )]);
        self.push_numeric(out, id, Response::RplCreated, vec![format!(
            "This server was created {}",
            created
        )]);
        self.push_numeric(out, id, Response::RplMyInfo, vec![
            self.server_name.clone(),
            SERVER_VERSION.to_string(),
            "iow".to_string(),
            "bimnstklov".to_string(),
        ]);
        self.push_numeric(out, id, Response::RplIsupport, vec![
            "CASEMAPPING=rfc1459".to_string(),
            "CHANTYPES=#&+!".to_string(),
            "CHANMODES=b,k,l,imnst".to_string(),
            "NICKLEN=9".to_string(),
            "are supported by this server".to_string(),
        ]);
        self.push_numeric(out, id, Response::ErrNoMotd, vec![
            "MOTD File is missing".to_string(),
        ]);
    }

    // ------------------------------------------------------------------
    // Channel membership
    // ------------------------------------------------------------------

    fn cmd_join(&mut self, id: SessionId, msg: &Message, out: &mut Vec<Reply>) {
        let names = match msg.param(0) {
            Some(names) if !names.is_empty() => names.to_string(),
            _ => {
                self.push_need_more_params(out, id, "JOIN");
                return;
            }
        };
        let keys: Vec<&str> = msg.param(1).map(|k| k.split(',').collect()).unwrap_or_default();

        for (i, name) in names.split(',').enumerate() {
            self.join_one(id, name, keys.get(i).copied(), out);
        }
    }

    fn join_one(&mut self, id: SessionId, name: &str, key: Option<&str>, out: &mut Vec<Reply>) {
        if !name.is_channel_name() {
            self.push_numeric(out, id, Response::ErrNoSuchChannel, vec![
                name.to_string(),
                "No such channel".to_string(),
            ]);
            return;
        }
        let folded = irc_to_lower(name);
        if self.sessions[&id].channels.contains(&folded) {
            // Re-joining a channel the session is already in is silently
            // idempotent; bridges replay JOINs after reconnects.
            return;
        }

        let creating = !self.channels.contains_key(&folded);
        if creating && self.channels.len() as u64 >= self.config.channel_limit {
            // ChannelLimit is absorbed into a numeric, like all
            // interpreter-level failures.
            self.push_numeric(out, id, Response::ErrTooManyChannels, vec![
                name.to_string(),
                "Channel limit reached".to_string(),
            ]);
            return;
        }

        if let Some(channel) = self.channels.get(&folded) {
            let session = &self.sessions[&id];
            let mask = session.prefix().to_string();
            if channel.bans.iter().any(|b| wildcard_match(&b.mask, &mask)) {
                self.push_numeric(out, id, Response::ErrBannedFromChan, vec![
                    channel.name.clone(),
                    "Cannot join channel (+b)".to_string(),
                ]);
                return;
            }
            if channel.has_mode('i')
                && !session.invited_to.contains(&folded)
                && !channel.invites.iter().any(|e| wildcard_match(&e.mask, &mask))
            {
                self.push_numeric(out, id, Response::ErrInviteOnlyChan, vec![
                    channel.name.clone(),
                    "Cannot join channel (+i)".to_string(),
                ]);
                return;
            }
            if let Some(channel_key) = &channel.key {
                if key != Some(channel_key.as_str()) {
                    self.push_numeric(out, id, Response::ErrBadChannelKey, vec![
                        channel.name.clone(),
                        "Cannot join channel (+k)".to_string(),
                    ]);
                    return;
                }
            }
            if let Some(limit) = channel.limit {
                if channel.members.len() >= limit {
                    self.push_numeric(out, id, Response::ErrChannelIsFull, vec![
                        channel.name.clone(),
                        "Cannot join channel (+l)".to_string(),
                    ]);
                    return;
                }
            }
        }

        let channel = self
            .channels
            .entry(folded.clone())
            .or_insert_with(|| Channel::new(name.to_string()));
        // The first member of a fresh channel is its operator.
        let modes = MemberModes {
            op: channel.members.is_empty(),
            voice: false,
        };
        channel.members.insert(id, modes);
        let display = channel.name.clone();
        let interested: BTreeSet<SessionId> = channel.member_ids().collect();

        {
            let session = self.sessions.get_mut(&id).expect("session exists");
            session.channels.insert(folded.clone());
            session.invited_to.remove(&folded);
        }

        let prefix = self.sessions[&id].prefix();
        out.push(Reply {
            msg: Message::new("JOIN", [display.clone()]).with_prefix(prefix),
            interested,
        });

        if let Some(topic) = self.channels[&folded].topic.clone() {
            self.push_numeric(out, id, Response::RplTopic, vec![display.clone(), topic.text]);
            self.push_numeric(out, id, Response::RplTopicWhoTime, vec![
                display.clone(),
                topic.set_by,
                (topic.set_at / 1_000_000_000).to_string(),
            ]);
        }
        self.names_replies(id, &folded, out);
    }

    fn cmd_part(&mut self, id: SessionId, msg: &Message, out: &mut Vec<Reply>) {
        let names = match msg.param(0) {
            Some(names) if !names.is_empty() => names.to_string(),
            _ => {
                self.push_need_more_params(out, id, "PART");
                return;
            }
        };
        let reason = msg.param(1).map(str::to_string);

        for name in names.split(',') {
            let folded = irc_to_lower(name);
            let display = match self.channels.get(&folded) {
                Some(channel) => channel.name.clone(),
                None => {
                    self.push_numeric(out, id, Response::ErrNoSuchChannel, vec![
                        name.to_string(),
                        "No such channel".to_string(),
                    ]);
                    continue;
                }
            };
            if !self.sessions[&id].channels.contains(&folded) {
                self.push_numeric(out, id, Response::ErrNotOnChannel, vec![
                    display,
                    "You're not on that channel".to_string(),
                ]);
                continue;
            }

            let interested: BTreeSet<SessionId> =
                self.channels[&folded].member_ids().collect();
            let mut part = Message::new("PART", [display]);
            if let Some(reason) = &reason {
                part = part.with_trailing(reason.clone());
            }
            out.push(Reply {
                msg: part.with_prefix(self.sessions[&id].prefix()),
                interested,
            });

            self.sessions.get_mut(&id).expect("session exists").channels.remove(&folded);
            self.remove_member(&folded, id);
        }
    }

    fn cmd_quit(&mut self, id: SessionId, msg: &Message, out: &mut Vec<Reply>) {
        let reason = msg.param(0).unwrap_or("").to_string();
        let prefix = self.sessions[&id].prefix();
        let mates = self.channel_mates(id);
        if !mates.is_empty() {
            out.push(Reply {
                msg: Message::new("QUIT", Vec::<String>::new())
                    .with_trailing(reason.clone())
                    .with_prefix(prefix),
                interested: mates,
            });
        }
        out.push(Reply::to_session(
            id,
            Message::new("ERROR", Vec::<String>::new()).with_trailing(format!(
                "Closing Link: {} ({})",
                self.sessions[&id].nick_or_star(),
                reason
            )),
        ));

        let channels: Vec<String> = self.sessions[&id].channels.iter().cloned().collect();
        for folded in channels {
            self.remove_member(&folded, id);
        }
        let session = self.sessions.get_mut(&id).expect("session exists");
        session.channels.clear();
        session.phase = Phase::Quit;
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    fn cmd_privmsg(&mut self, id: SessionId, msg: &Message, notice: bool, out: &mut Vec<Reply>) {
        let verb = if notice { "NOTICE" } else { "PRIVMSG" };
        let target = match msg.param(0) {
            Some(target) if !target.is_empty() => target.to_string(),
            _ => {
                if !notice {
                    self.push_numeric(out, id, Response::ErrNoRecipient, vec![format!(
                        "No recipient given ({})",
                        verb
                    )]);
                }
                return;
            }
        };
        let text = match msg.param(1) {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => {
                if !notice {
                    self.push_numeric(out, id, Response::ErrNoTextToSend, vec![
                        "No text to send".to_string(),
                    ]);
                }
                return;
            }
        };

        if target.as_str().is_channel_name() {
            let folded = irc_to_lower(&target);
            let channel = match self.channels.get(&folded) {
                Some(channel) => channel,
                None => {
                    if !notice {
                        self.push_numeric(out, id, Response::ErrNoSuchChannel, vec![
                            target,
                            "No such channel".to_string(),
                        ]);
                    }
                    return;
                }
            };
            let member = channel.members.get(&id).copied();
            if member.is_none() && channel.has_mode('n') {
                if !notice {
                    self.push_numeric(out, id, Response::ErrCannotSendToChan, vec![
                        channel.name.clone(),
                        "Cannot send to channel".to_string(),
                    ]);
                }
                return;
            }
            if channel.has_mode('m') && !member.is_some_and(|m| m.can_speak_when_moderated()) {
                if !notice {
                    self.push_numeric(out, id, Response::ErrCannotSendToChan, vec![
                        channel.name.clone(),
                        "Cannot send to channel".to_string(),
                    ]);
                }
                return;
            }
            // The sender never sees its own channel message again.
            let mut interested: BTreeSet<SessionId> = channel.member_ids().collect();
            interested.remove(&id);
            let display = channel.name.clone();
            out.push(Reply {
                msg: Message::new(verb, [display])
                    .with_trailing(text)
                    .with_prefix(self.sessions[&id].prefix()),
                interested,
            });
        } else {
            let (target_id, target_nick, target_away) = match self.session_by_nick(&target) {
                Some(session) => (session.id, session.nick.clone(), session.away.clone()),
                None => {
                    if !notice {
                        self.push_numeric(out, id, Response::ErrNoSuchNick, vec![
                            target,
                            "No such nick/channel".to_string(),
                        ]);
                    }
                    return;
                }
            };
            out.push(Reply::to_session(
                target_id,
                Message::new(verb, [target_nick.clone()])
                    .with_trailing(text)
                    .with_prefix(self.sessions[&id].prefix()),
            ));
            if !notice {
                if let Some(away) = target_away {
                    self.push_numeric(out, id, Response::RplAway, vec![target_nick, away]);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Channel metadata
    // ------------------------------------------------------------------

    fn cmd_topic(&mut self, id: SessionId, msg: &Message, now: i64, out: &mut Vec<Reply>) {
        let name = match msg.param(0) {
            Some(name) => name.to_string(),
            None => {
                self.push_need_more_params(out, id, "TOPIC");
                return;
            }
        };
        let folded = irc_to_lower(&name);
        let (display, is_member) = match self.channels.get(&folded) {
            Some(channel) => (channel.name.clone(), channel.members.contains_key(&id)),
            None => {
                self.push_numeric(out, id, Response::ErrNoSuchChannel, vec![
                    name,
                    "No such channel".to_string(),
                ]);
                return;
            }
        };

        if msg.params.len() == 1 {
            let channel = &self.channels[&folded];
            if channel.has_mode('s') && !is_member {
                self.push_numeric(out, id, Response::ErrNotOnChannel, vec![
                    display,
                    "You're not on that channel".to_string(),
                ]);
                return;
            }
            match channel.topic.clone() {
                Some(topic) => {
                    self.push_numeric(out, id, Response::RplTopic, vec![
                        display.clone(),
                        topic.text,
                    ]);
                    self.push_numeric(out, id, Response::RplTopicWhoTime, vec![
                        display,
                        topic.set_by,
                        (topic.set_at / 1_000_000_000).to_string(),
                    ]);
                }
                None => {
                    self.push_numeric(out, id, Response::RplNoTopic, vec![
                        display,
                        "No topic is set".to_string(),
                    ]);
                }
            }
            return;
        }

        if !is_member {
            self.push_numeric(out, id, Response::ErrNotOnChannel, vec![
                display,
                "You're not on that channel".to_string(),
            ]);
            return;
        }
        if self.channels[&folded].has_mode('t')
            && !self.channels[&folded].members[&id].op
        {
            self.push_numeric(out, id, Response::ErrChanOpPrivsNeeded, vec![
                display,
                "You're not channel operator".to_string(),
            ]);
            return;
        }

        let text = msg.params[1].clone();
        let nick = self.sessions[&id].nick.clone();
        {
            let channel = self.channels.get_mut(&folded).expect("channel exists");
            if text.is_empty() {
                channel.topic = None;
            } else {
                channel.topic = Some(Topic {
                    text: text.clone(),
                    set_by: nick,
                    set_at: now,
                });
            }
        }
        let interested: BTreeSet<SessionId> = self.channels[&folded].member_ids().collect();
        out.push(Reply {
            msg: Message::new("TOPIC", [display])
                .with_trailing(text)
                .with_prefix(self.sessions[&id].prefix()),
            interested,
        });
    }

    fn cmd_mode(&mut self, id: SessionId, msg: &Message, now: i64, out: &mut Vec<Reply>) {
        let target = match msg.param(0) {
            Some(target) => target.to_string(),
            None => {
                self.push_need_more_params(out, id, "MODE");
                return;
            }
        };
        if target.as_str().is_channel_name() {
            self.channel_mode(id, &target, msg, now, out);
        } else {
            self.user_mode(id, &target, msg, out);
        }
    }

    fn user_mode(&mut self, id: SessionId, target: &str, msg: &Message, out: &mut Vec<Reply>) {
        if !robust_proto::irc_eq(target, &self.sessions[&id].nick) {
            self.push_numeric(out, id, Response::ErrUsersDontMatch, vec![
                "Cannot change mode for other users".to_string(),
            ]);
            return;
        }
        if msg.params.len() == 1 {
            let modes: String = self.sessions[&id].modes.iter().collect();
            self.push_numeric(out, id, Response::RplUmodeIs, vec![format!("+{}", modes)]);
            return;
        }

        let mut adding = true;
        let mut applied = String::new();
        for c in msg.params[1].chars() {
            match c {
                '+' => adding = true,
                '-' => adding = false,
                'i' | 'w' => {
                    let session = self.sessions.get_mut(&id).expect("session exists");
                    let changed = if adding {
                        session.modes.insert(c)
                    } else {
                        session.modes.remove(&c)
                    };
                    if changed {
                        applied.push(if adding { '+' } else { '-' });
                        applied.push(c);
                    }
                }
                'o' if !adding => {
                    let session = self.sessions.get_mut(&id).expect("session exists");
                    if session.modes.remove(&'o') {
                        session.operator = false;
                        applied.push_str("-o");
                    }
                }
                // +o only ever comes from OPER.
                'o' => {}
                _ => {
                    self.push_numeric(out, id, Response::ErrUmodeUnknownFlag, vec![
                        "Unknown MODE flag".to_string(),
                    ]);
                }
            }
        }
        if !applied.is_empty() {
            let nick = self.sessions[&id].nick.clone();
            out.push(Reply::to_session(
                id,
                Message::new("MODE", [nick, applied]).with_prefix(self.sessions[&id].prefix()),
            ));
        }
    }

    fn channel_mode(
        &mut self,
        id: SessionId,
        target: &str,
        msg: &Message,
        now: i64,
        out: &mut Vec<Reply>,
    ) {
        let folded = irc_to_lower(target);
        let display = match self.channels.get(&folded) {
            Some(channel) => channel.name.clone(),
            None => {
                self.push_numeric(out, id, Response::ErrNoSuchChannel, vec![
                    target.to_string(),
                    "No such channel".to_string(),
                ]);
                return;
            }
        };

        if msg.params.len() == 1 {
            let mut params = vec![display];
            params.extend(self.channels[&folded].mode_params());
            self.push_numeric(out, id, Response::RplChannelModeIs, params);
            return;
        }

        let modestring = msg.params[1].clone();
        // A bare `+b`/`b` with no mask queries the ban list.
        if msg.params.len() == 2 && modestring.trim_start_matches(['+', '-']) == "b" {
            for entry in self.channels[&folded].bans.clone() {
                self.push_numeric(out, id, Response::RplBanList, vec![
                    display.clone(),
                    entry.mask,
                    entry.set_by,
                    (entry.set_at / 1_000_000_000).to_string(),
                ]);
            }
            self.push_numeric(out, id, Response::RplEndOfBanList, vec![
                display,
                "End of channel ban list".to_string(),
            ]);
            return;
        }

        if !self.channels[&folded].members.contains_key(&id) {
            self.push_numeric(out, id, Response::ErrNotOnChannel, vec![
                display,
                "You're not on that channel".to_string(),
            ]);
            return;
        }
        if !self.channels[&folded].members[&id].op {
            self.push_numeric(out, id, Response::ErrChanOpPrivsNeeded, vec![
                display,
                "You're not channel operator".to_string(),
            ]);
            return;
        }

        // Arguments are consumed left to right as the mode string demands
        // them.
        let mut args = msg.params[2..].iter();
        let mut adding = true;
        let mut applied_flags = String::new();
        let mut applied_args: Vec<String> = Vec::new();
        let mut last_sign = ' ';
        let nick = self.sessions[&id].nick.clone();

        for c in modestring.chars() {
            match c {
                '+' => adding = true,
                '-' => adding = false,
                'o' | 'v' => {
                    let target_nick = match args.next() {
                        Some(nick) => nick.clone(),
                        None => continue,
                    };
                    let member_id = match self.session_by_nick(&target_nick) {
                        Some(session) => session.id,
                        None => {
                            self.push_numeric(out, id, Response::ErrNoSuchNick, vec![
                                target_nick,
                                "No such nick/channel".to_string(),
                            ]);
                            continue;
                        }
                    };
                    if !self.channels[&folded].members.contains_key(&member_id) {
                        self.push_numeric(out, id, Response::ErrUserNotInChannel, vec![
                            target_nick,
                            display.clone(),
                            "They aren't on that channel".to_string(),
                        ]);
                        continue;
                    }
                    let channel = self.channels.get_mut(&folded).expect("channel exists");
                    let member = channel.members.get_mut(&member_id).expect("checked above");
                    if c == 'o' {
                        member.op = adding;
                    } else {
                        member.voice = adding;
                    }
                    push_flag(&mut applied_flags, &mut last_sign, adding, c);
                    applied_args.push(target_nick);
                }
                'b' => {
                    let mask = match args.next() {
                        Some(mask) => mask.clone(),
                        None => continue,
                    };
                    let channel = self.channels.get_mut(&folded).expect("channel exists");
                    if adding {
                        channel.bans.push(ListEntry {
                            mask: mask.clone(),
                            set_by: nick.clone(),
                            set_at: now,
                        });
                    } else {
                        channel.bans.retain(|e| e.mask != mask);
                    }
                    push_flag(&mut applied_flags, &mut last_sign, adding, 'b');
                    applied_args.push(mask);
                }
                'k' => {
                    let channel = self.channels.get_mut(&folded).expect("channel exists");
                    if adding {
                        let key = match args.next() {
                            Some(key) => key.clone(),
                            None => continue,
                        };
                        channel.key = Some(key.clone());
                        push_flag(&mut applied_flags, &mut last_sign, adding, 'k');
                        applied_args.push(key);
                    } else {
                        channel.key = None;
                        push_flag(&mut applied_flags, &mut last_sign, adding, 'k');
                    }
                }
                'l' => {
                    let channel = self.channels.get_mut(&folded).expect("channel exists");
                    if adding {
                        let limit = match args.next().and_then(|a| a.parse::<usize>().ok()) {
                            Some(limit) => limit,
                            None => continue,
                        };
                        channel.limit = Some(limit);
                        push_flag(&mut applied_flags, &mut last_sign, adding, 'l');
                        applied_args.push(limit.to_string());
                    } else {
                        channel.limit = None;
                        push_flag(&mut applied_flags, &mut last_sign, adding, 'l');
                    }
                }
                'i' | 'm' | 'n' | 's' | 't' => {
                    let channel = self.channels.get_mut(&folded).expect("channel exists");
                    let changed = if adding {
                        channel.modes.insert(c)
                    } else {
                        channel.modes.remove(&c)
                    };
                    if changed {
                        push_flag(&mut applied_flags, &mut last_sign, adding, c);
                    }
                }
                _ => {
                    self.push_numeric(out, id, Response::ErrUnknownMode, vec![
                        c.to_string(),
                        "is unknown mode char to me".to_string(),
                    ]);
                }
            }
        }

        if !applied_flags.is_empty() {
            let interested: BTreeSet<SessionId> = self.channels[&folded].member_ids().collect();
            let mut params = vec![display, applied_flags];
            params.extend(applied_args);
            out.push(Reply {
                msg: Message::new("MODE", params).with_prefix(self.sessions[&id].prefix()),
                interested,
            });
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn cmd_names(&mut self, id: SessionId, msg: &Message, out: &mut Vec<Reply>) {
        match msg.param(0) {
            Some(name) => {
                let folded = irc_to_lower(name);
                if self.channels.contains_key(&folded) {
                    self.names_replies(id, &folded, out);
                } else {
                    self.push_numeric(out, id, Response::RplEndOfNames, vec![
                        name.to_string(),
                        "End of /NAMES list.".to_string(),
                    ]);
                }
            }
            None => {
                self.push_numeric(out, id, Response::RplEndOfNames, vec![
                    "*".to_string(),
                    "End of /NAMES list.".to_string(),
                ]);
            }
        }
    }

    /// 353/366 burst for one channel, split at parameter boundaries so no
    /// line exceeds the 512 byte limit.
    fn names_replies(&self, id: SessionId, folded: &str, out: &mut Vec<Reply>) {
        let channel = &self.channels[folded];
        let display = channel.name.clone();
        let nick = self.sessions[&id].nick_or_star().to_string();

        let mut names: Vec<String> = Vec::new();
        for (member_id, modes) in &channel.members {
            if let Some(member) = self.sessions.get(member_id) {
                let mut name = String::new();
                if let Some(prefix) = modes.prefix_char() {
                    name.push(prefix);
                }
                name.push_str(&member.nick);
                names.push(name);
            }
        }

        let mut chunk: Vec<String> = Vec::new();
        for name in names {
            let mut candidate = chunk.clone();
            candidate.push(name.clone());
            let msg = Message::numeric(&self.server_name, Response::RplNamreply, [
                nick.clone(),
                "=".to_string(),
                display.clone(),
                candidate.join(" "),
            ]);
            if msg.encoded_len() > MAX_LINE_LEN && !chunk.is_empty() {
                out.push(Reply::to_session(
                    id,
                    Message::numeric(&self.server_name, Response::RplNamreply, [
                        nick.clone(),
                        "=".to_string(),
                        display.clone(),
                        chunk.join(" "),
                    ]),
                ));
                chunk = vec![name];
            } else {
                chunk.push(name);
            }
        }
        if !chunk.is_empty() {
            out.push(Reply::to_session(
                id,
                Message::numeric(&self.server_name, Response::RplNamreply, [
                    nick.clone(),
                    "=".to_string(),
                    display.clone(),
                    chunk.join(" "),
                ]),
            ));
        }
        self.push_numeric(out, id, Response::RplEndOfNames, vec![
            display,
            "End of /NAMES list.".to_string(),
        ]);
    }

    fn cmd_who(&mut self, id: SessionId, msg: &Message, out: &mut Vec<Reply>) {
        let mask = msg.param(0).unwrap_or("*").to_string();

        if mask.as_str().is_channel_name() {
            let folded = irc_to_lower(&mask);
            if let Some(channel) = self.channels.get(&folded) {
                let display = channel.name.clone();
                for (member_id, modes) in channel.members.clone() {
                    if let Some(member) = self.sessions.get(&member_id) {
                        let mut flags = String::from(if member.away.is_some() { "G" } else { "H" });
                        if member.operator {
                            flags.push('*');
                        }
                        if let Some(prefix) = modes.prefix_char() {
                            flags.push(prefix);
                        }
                        self.push_numeric(out, id, Response::RplWhoReply, vec![
                            display.clone(),
                            format!("~{}", member.username),
                            format!("robust/{}", member.id),
                            self.server_name.clone(),
                            member.nick.clone(),
                            flags,
                            format!("0 {}", member.realname),
                        ]);
                    }
                }
            }
        } else if let Some(target) = self.session_by_nick(&mask) {
            let target = target.clone();
            let mut flags = String::from(if target.away.is_some() { "G" } else { "H" });
            if target.operator {
                flags.push('*');
            }
            self.push_numeric(out, id, Response::RplWhoReply, vec![
                "*".to_string(),
                format!("~{}", target.username),
                format!("robust/{}", target.id),
                self.server_name.clone(),
                target.nick.clone(),
                flags,
                format!("0 {}", target.realname),
            ]);
        }

        self.push_numeric(out, id, Response::RplEndOfWho, vec![
            mask,
            "End of /WHO list.".to_string(),
        ]);
    }

    fn cmd_whois(&mut self, id: SessionId, msg: &Message, now: i64, out: &mut Vec<Reply>) {
        let mask = match msg.param(0) {
            Some(mask) if !mask.is_empty() => mask.to_string(),
            _ => {
                self.push_numeric(out, id, Response::ErrNoNicknameGiven, vec![
                    "No nickname given".to_string(),
                ]);
                return;
            }
        };
        let target = match self.session_by_nick(&mask) {
            Some(target) => target.clone(),
            None => {
                self.push_numeric(out, id, Response::ErrNoSuchNick, vec![
                    mask.clone(),
                    "No such nick/channel".to_string(),
                ]);
                self.push_numeric(out, id, Response::RplEndOfWhois, vec![
                    mask,
                    "End of /WHOIS list.".to_string(),
                ]);
                return;
            }
        };

        self.push_numeric(out, id, Response::RplWhoisUser, vec![
            target.nick.clone(),
            format!("~{}", target.username),
            format!("robust/{}", target.id),
            "*".to_string(),
            target.realname.clone(),
        ]);
        if !target.channels.is_empty() {
            let mut channels: Vec<String> = Vec::new();
            for folded in &target.channels {
                if let Some(channel) = self.channels.get(folded) {
                    let mut name = String::new();
                    if let Some(prefix) =
                        channel.members.get(&target.id).and_then(|m| m.prefix_char())
                    {
                        name.push(prefix);
                    }
                    name.push_str(&channel.name);
                    channels.push(name);
                }
            }
            self.push_numeric(out, id, Response::RplWhoisChannels, vec![
                target.nick.clone(),
                channels.join(" "),
            ]);
        }
        self.push_numeric(out, id, Response::RplWhoisServer, vec![
            target.nick.clone(),
            self.server_name.clone(),
            "RobustIRC".to_string(),
        ]);
        if target.operator {
            self.push_numeric(out, id, Response::RplWhoisOperator, vec![
                target.nick.clone(),
                "is an IRC operator".to_string(),
            ]);
        }
        if let Some(away) = &target.away {
            self.push_numeric(out, id, Response::RplAway, vec![
                target.nick.clone(),
                away.clone(),
            ]);
        }
        self.push_numeric(out, id, Response::RplWhoisIdle, vec![
            target.nick.clone(),
            ((now - target.last_activity) / 1_000_000_000).to_string(),
            (target.created / 1_000_000_000).to_string(),
            "seconds idle, signon time".to_string(),
        ]);
        self.push_numeric(out, id, Response::RplEndOfWhois, vec![
            target.nick,
            "End of /WHOIS list.".to_string(),
        ]);
    }

    fn cmd_list(&mut self, id: SessionId, msg: &Message, out: &mut Vec<Reply>) {
        let filter: Option<BTreeSet<String>> = msg
            .param(0)
            .map(|names| names.split(',').map(irc_to_lower).collect());

        for (folded, channel) in self.channels.clone() {
            if let Some(filter) = &filter {
                if !filter.contains(&folded) {
                    continue;
                }
            }
            if channel.has_mode('s') && !channel.members.contains_key(&id) {
                continue;
            }
            let topic = channel.topic.as_ref().map(|t| t.text.clone()).unwrap_or_default();
            self.push_numeric(out, id, Response::RplList, vec![
                channel.name.clone(),
                channel.members.len().to_string(),
                topic,
            ]);
        }
        self.push_numeric(out, id, Response::RplListEnd, vec![
            "End of /LIST".to_string(),
        ]);
    }

    fn cmd_ison(&mut self, id: SessionId, msg: &Message, out: &mut Vec<Reply>) {
        if msg.params.is_empty() {
            self.push_need_more_params(out, id, "ISON");
            return;
        }
        let mut online: Vec<String> = Vec::new();
        for param in &msg.params {
            for nick in param.split(' ') {
                if nick.is_empty() {
                    continue;
                }
                if let Some(session) = self.session_by_nick(nick) {
                    online.push(session.nick.clone());
                }
            }
        }
        self.push_numeric(out, id, Response::RplIson, vec![online.join(" ")]);
    }

    fn cmd_away(&mut self, id: SessionId, msg: &Message, out: &mut Vec<Reply>) {
        let text = msg.param(0).unwrap_or("");
        if text.is_empty() {
            self.sessions.get_mut(&id).expect("session exists").away = None;
            self.push_numeric(out, id, Response::RplUnaway, vec![
                "You are no longer marked as being away".to_string(),
            ]);
        } else {
            self.sessions.get_mut(&id).expect("session exists").away = Some(text.to_string());
            self.push_numeric(out, id, Response::RplNowAway, vec![
                "You have been marked as being away".to_string(),
            ]);
        }
    }

    // ------------------------------------------------------------------
    // Moderation
    // ------------------------------------------------------------------

    fn cmd_kick(&mut self, id: SessionId, msg: &Message, out: &mut Vec<Reply>) {
        if msg.params.len() < 2 {
            self.push_need_more_params(out, id, "KICK");
            return;
        }
        let folded = irc_to_lower(&msg.params[0]);
        let display = match self.channels.get(&folded) {
            Some(channel) => channel.name.clone(),
            None => {
                self.push_numeric(out, id, Response::ErrNoSuchChannel, vec![
                    msg.params[0].clone(),
                    "No such channel".to_string(),
                ]);
                return;
            }
        };
        if !self.channels[&folded].members.contains_key(&id) {
            self.push_numeric(out, id, Response::ErrNotOnChannel, vec![
                display,
                "You're not on that channel".to_string(),
            ]);
            return;
        }
        if !self.channels[&folded].members[&id].op {
            self.push_numeric(out, id, Response::ErrChanOpPrivsNeeded, vec![
                display,
                "You're not channel operator".to_string(),
            ]);
            return;
        }
        let (target_id, target_nick) = match self.session_by_nick(&msg.params[1]) {
            Some(session) if self.channels[&folded].members.contains_key(&session.id) => {
                (session.id, session.nick.clone())
            }
            _ => {
                self.push_numeric(out, id, Response::ErrUserNotInChannel, vec![
                    msg.params[1].clone(),
                    display,
                    "They aren't on that channel".to_string(),
                ]);
                return;
            }
        };
        let reason = msg
            .param(2)
            .map(str::to_string)
            .unwrap_or_else(|| self.sessions[&id].nick.clone());

        // The target is still a member when the KICK goes out, so it sees
        // its own removal.
        let interested: BTreeSet<SessionId> = self.channels[&folded].member_ids().collect();
        out.push(Reply {
            msg: Message::new("KICK", [display, target_nick])
                .with_trailing(reason)
                .with_prefix(self.sessions[&id].prefix()),
            interested,
        });

        self.sessions
            .get_mut(&target_id)
            .expect("member sessions are live")
            .channels
            .remove(&folded);
        self.remove_member(&folded, target_id);
    }

    fn cmd_invite(&mut self, id: SessionId, msg: &Message, out: &mut Vec<Reply>) {
        if msg.params.len() < 2 {
            self.push_need_more_params(out, id, "INVITE");
            return;
        }
        let (target_id, target_nick, target_away) = match self.session_by_nick(&msg.params[0]) {
            Some(session) => (session.id, session.nick.clone(), session.away.clone()),
            None => {
                self.push_numeric(out, id, Response::ErrNoSuchNick, vec![
                    msg.params[0].clone(),
                    "No such nick/channel".to_string(),
                ]);
                return;
            }
        };
        let name = msg.params[1].clone();
        let folded = irc_to_lower(&name);

        if let Some(channel) = self.channels.get(&folded) {
            let display = channel.name.clone();
            if !channel.members.contains_key(&id) {
                self.push_numeric(out, id, Response::ErrNotOnChannel, vec![
                    display,
                    "You're not on that channel".to_string(),
                ]);
                return;
            }
            if channel.has_mode('i') && !channel.members[&id].op {
                self.push_numeric(out, id, Response::ErrChanOpPrivsNeeded, vec![
                    display,
                    "You're not channel operator".to_string(),
                ]);
                return;
            }
            if channel.members.contains_key(&target_id) {
                self.push_numeric(out, id, Response::ErrUserOnChannel, vec![
                    target_nick,
                    display,
                    "is already on channel".to_string(),
                ]);
                return;
            }
        }

        self.sessions
            .get_mut(&target_id)
            .expect("session exists")
            .invited_to
            .insert(folded);
        self.push_numeric(out, id, Response::RplInviting, vec![
            target_nick.clone(),
            name.clone(),
        ]);
        out.push(Reply::to_session(
            target_id,
            Message::new("INVITE", [target_nick.clone()])
                .with_trailing(name)
                .with_prefix(self.sessions[&id].prefix()),
        ));
        if let Some(away) = target_away {
            self.push_numeric(out, id, Response::RplAway, vec![target_nick, away]);
        }
    }

    fn cmd_oper(&mut self, id: SessionId, msg: &Message, out: &mut Vec<Reply>) {
        if msg.params.len() < 2 {
            self.push_need_more_params(out, id, "OPER");
            return;
        }
        let expected = match self.config.operators.get(&msg.params[0]) {
            Some(password) => password.clone(),
            None => {
                self.push_numeric(out, id, Response::ErrNoOperHost, vec![
                    "No O-lines for your host".to_string(),
                ]);
                return;
            }
        };
        if expected != msg.params[1] {
            self.push_numeric(out, id, Response::ErrPasswdMismatch, vec![
                "Password incorrect".to_string(),
            ]);
            return;
        }
        {
            let session = self.sessions.get_mut(&id).expect("session exists");
            session.operator = true;
            session.modes.insert('o');
        }
        self.push_numeric(out, id, Response::RplYoureOper, vec![
            "You are now an IRC operator".to_string(),
        ]);
    }

    fn cmd_kill(&mut self, id: SessionId, msg: &Message, now: i64, out: &mut Vec<Reply>) {
        if msg.params.len() < 2 {
            self.push_need_more_params(out, id, "KILL");
            return;
        }
        if !self.sessions[&id].operator {
            self.push_numeric(out, id, Response::ErrNoPrivileges, vec![
                "Permission Denied - You're not an IRC operator".to_string(),
            ]);
            return;
        }
        let target_id = match self.session_by_nick(&msg.params[0]) {
            Some(session) => session.id,
            None => {
                self.push_numeric(out, id, Response::ErrNoSuchNick, vec![
                    msg.params[0].clone(),
                    "No such nick/channel".to_string(),
                ]);
                return;
            }
        };
        let reason = format!("Killed by {}: {}", self.sessions[&id].nick, msg.params[1]);
        out.push(Reply::to_session(
            target_id,
            Message::new("ERROR", Vec::<String>::new())
                .with_trailing(format!("Closing Link: {}", reason)),
        ));
        out.extend(self.delete_session(target_id, &reason, now));
    }
}

/// Append a mode flag to the applied string, inserting `+`/`-` only when the
/// direction changes.
fn push_flag(applied: &mut String, last_sign: &mut char, adding: bool, flag: char) {
    let sign = if adding { '+' } else { '-' };
    if *last_sign != sign {
        applied.push(sign);
        *last_sign = sign;
    }
    applied.push(flag);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ircserver::IrcServer;

    const NOW: i64 = 1_000_000_000_000;

    fn server() -> IrcServer {
        let mut server = IrcServer::new("robustirc.net");
        server.server_created = NOW;
        server
    }

    fn register(server: &mut IrcServer, id: u64, nick: &str) -> SessionId {
        let session = SessionId(id);
        server.create_session(session, "10.0.0.1:1", NOW).unwrap();
        server.process_message(session, &format!("NICK {}", nick), NOW);
        server.process_message(session, &format!("USER {} 0 * :{}", nick, nick), NOW);
        session
    }

    fn lines_for(replies: &[Reply], id: SessionId) -> Vec<String> {
        replies
            .iter()
            .filter(|r| r.interested.contains(&id))
            .map(|r| r.msg.to_string())
            .collect()
    }

    #[test]
    fn test_registration_burst() {
        let mut server = server();
        let id = SessionId(1);
        server.create_session(id, "10.0.0.1:1", NOW).unwrap();
        let replies = server.process_message(id, "NICK secure", NOW);
        assert!(replies.is_empty());
        let replies = server.process_message(id, "USER blah 0 * :Michael", NOW);
        let lines = lines_for(&replies, id);
        assert!(lines[0].starts_with(":robustirc.net 001 secure :Welcome"));
        assert!(lines.iter().any(|l| l.contains(" 005 ")));
        assert!(lines.last().unwrap().contains("422"));
        assert!(server.sessions[&id].registered());
    }

    #[test]
    fn test_command_before_registration() {
        let mut server = server();
        let id = SessionId(1);
        server.create_session(id, "10.0.0.1:1", NOW).unwrap();
        let replies = server.process_message(id, "JOIN #test", NOW);
        assert!(replies[0].msg.to_string().contains(" 451 "));
    }

    #[test]
    fn test_pass_moves_to_authenticating() {
        let mut server = server();
        let id = SessionId(1);
        server.create_session(id, "10.0.0.1:1", NOW).unwrap();
        server.process_message(id, "PASS sekrit", NOW);
        assert_eq!(server.sessions[&id].phase, Phase::Authenticating);
        assert_eq!(server.sessions[&id].password, "sekrit");
    }

    #[test]
    fn test_nick_collision_keeps_first_owner() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        let s2 = SessionId(2);
        server.create_session(s2, "10.0.0.1:2", NOW).unwrap();
        let replies = server.process_message(s2, "NICK alice", NOW);
        let lines = lines_for(&replies, s2);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(" 433 * alice :Nickname is already in use"));
        assert_eq!(server.sessions[&s1].nick, "alice");
        assert!(server.sessions[&s2].nick.is_empty());
    }

    #[test]
    fn test_nick_case_change_is_allowed() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        let replies = server.process_message(s1, "NICK Alice", NOW);
        assert!(lines_for(&replies, s1)[0].ends_with("NICK Alice"));
        assert_eq!(server.sessions[&s1].nick, "Alice");
    }

    #[test]
    fn test_cap_negotiation_offers_nothing() {
        let mut server = server();
        let id = SessionId(1);
        server.create_session(id, "10.0.0.1:1", NOW).unwrap();
        let replies = server.process_message(id, "CAP LS 302", NOW);
        assert_eq!(lines_for(&replies, id), vec![":robustirc.net CAP * LS :"]);

        let replies = server.process_message(id, "CAP REQ :multi-prefix", NOW);
        assert_eq!(
            lines_for(&replies, id),
            vec![":robustirc.net CAP * NAK :multi-prefix"]
        );

        assert!(server.process_message(id, "CAP END", NOW).is_empty());
    }

    #[test]
    fn test_unknown_command() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        let replies = server.process_message(s1, "FROBNICATE", NOW);
        assert!(lines_for(&replies, s1)[0].contains(" 421 alice FROBNICATE :Unknown command"));
    }

    #[test]
    fn test_parse_error_becomes_notice() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        let replies = server.process_message(s1, "PRIV@MSG oops", NOW);
        let line = &lines_for(&replies, s1)[0];
        assert!(line.starts_with(":robustirc.net NOTICE alice :Unable to parse"));
    }

    #[test]
    fn test_join_broadcast_and_names() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        let s2 = register(&mut server, 2, "bob");
        server.process_message(s1, "JOIN #test", NOW);
        let replies = server.process_message(s2, "JOIN #test", NOW);

        // alice sees bob's JOIN; bob additionally gets the NAMES burst.
        assert_eq!(lines_for(&replies, s1), vec![":bob!~bob@robust/0x2 JOIN #test"]);
        let bob_lines = lines_for(&replies, s2);
        assert!(bob_lines[0].ends_with("JOIN #test"));
        assert!(bob_lines.iter().any(|l| l.contains(" 353 bob = #test :@alice bob")));
        assert!(bob_lines.last().unwrap().contains(" 366 "));
    }

    #[test]
    fn test_duplicate_join_is_silent() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        server.process_message(s1, "JOIN #test", NOW);
        let replies = server.process_message(s1, "JOIN #test", NOW);
        assert!(replies.is_empty());
    }

    #[test]
    fn test_privmsg_excludes_sender() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        let s2 = register(&mut server, 2, "bob");
        server.process_message(s1, "JOIN #test", NOW);
        server.process_message(s2, "JOIN #test", NOW);
        let replies = server.process_message(s1, "PRIVMSG #test :hi", NOW);
        assert_eq!(
            lines_for(&replies, s2),
            vec![":alice!~alice@robust/0x1 PRIVMSG #test :hi"]
        );
        assert!(lines_for(&replies, s1).is_empty());
    }

    #[test]
    fn test_privmsg_to_nick() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        let s2 = register(&mut server, 2, "bob");
        let replies = server.process_message(s1, "PRIVMSG bob :psst", NOW);
        assert_eq!(
            lines_for(&replies, s2),
            vec![":alice!~alice@robust/0x1 PRIVMSG bob :psst"]
        );
    }

    #[test]
    fn test_privmsg_away_reply() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        let s2 = register(&mut server, 2, "bob");
        server.process_message(s2, "AWAY :gone fishing", NOW);
        let replies = server.process_message(s1, "PRIVMSG bob :psst", NOW);
        assert!(lines_for(&replies, s1)[0].contains(" 301 alice bob :gone fishing"));
    }

    #[test]
    fn test_quit_broadcasts_and_frees_nick() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        let s2 = register(&mut server, 2, "bob");
        server.process_message(s1, "JOIN #x", NOW);
        server.process_message(s2, "JOIN #x", NOW);
        let replies = server.process_message(s1, "QUIT :bye", NOW);
        assert_eq!(lines_for(&replies, s2), vec![":alice!~alice@robust/0x1 QUIT :bye"]);
        assert!(lines_for(&replies, s1)[0].starts_with("ERROR :Closing Link"));

        let channel = server.channel_by_name("#x").unwrap();
        assert_eq!(channel.members.len(), 1);
        assert!(channel.members.contains_key(&s2));

        // The nick is free again, and further input is discarded.
        assert!(server.session_by_nick("alice").is_none());
        let replies = server.process_message(s1, "PRIVMSG #x :zombie", NOW);
        assert!(lines_for(&replies, s1)[0].contains("session is closed"));
    }

    #[test]
    fn test_part_destroys_empty_channel() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        server.process_message(s1, "JOIN #test", NOW);
        let replies = server.process_message(s1, "PART #test :done", NOW);
        assert_eq!(
            lines_for(&replies, s1),
            vec![":alice!~alice@robust/0x1 PART #test :done"]
        );
        assert!(server.channel_by_name("#test").is_none());
        assert!(server.sessions[&s1].channels.is_empty());
    }

    #[test]
    fn test_topic_set_and_query() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        let s2 = register(&mut server, 2, "bob");
        server.process_message(s1, "JOIN #test", NOW);
        server.process_message(s2, "JOIN #test", NOW);

        let replies = server.process_message(s1, "TOPIC #test :all things robust", NOW);
        assert_eq!(
            lines_for(&replies, s2),
            vec![":alice!~alice@robust/0x1 TOPIC #test :all things robust"]
        );

        let replies = server.process_message(s2, "TOPIC #test", NOW);
        let lines = lines_for(&replies, s2);
        assert!(lines[0].contains(" 332 bob #test :all things robust"));
        assert!(lines[1].contains(" 333 bob #test alice"));
    }

    #[test]
    fn test_mode_channel_ops() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        let s2 = register(&mut server, 2, "bob");
        server.process_message(s1, "JOIN #test", NOW);
        server.process_message(s2, "JOIN #test", NOW);

        // bob is not op.
        let replies = server.process_message(s2, "MODE #test +t", NOW);
        assert!(lines_for(&replies, s2)[0].contains(" 482 "));

        let replies = server.process_message(s1, "MODE #test +o bob", NOW);
        assert_eq!(
            lines_for(&replies, s2),
            vec![":alice!~alice@robust/0x1 MODE #test +o bob"]
        );
        assert!(server.channel_by_name("#test").unwrap().members[&s2].op);

        let replies = server.process_message(s1, "MODE #test +k sekrit", NOW);
        assert!(lines_for(&replies, s1)[0].ends_with("MODE #test +k sekrit"));

        let replies = server.process_message(s1, "MODE #test", NOW);
        assert!(lines_for(&replies, s1)[0].contains(" 324 alice #test +k :sekrit"));
    }

    #[test]
    fn test_join_checks_key_invite_ban_limit() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        let s2 = register(&mut server, 2, "bob");
        server.process_message(s1, "JOIN #test", NOW);

        server.process_message(s1, "MODE #test +k sekrit", NOW);
        let replies = server.process_message(s2, "JOIN #test", NOW);
        assert!(lines_for(&replies, s2)[0].contains(" 475 "));
        let replies = server.process_message(s2, "JOIN #test sekrit", NOW);
        assert!(lines_for(&replies, s2)[0].ends_with("JOIN #test"));
        server.process_message(s2, "PART #test", NOW);
        server.process_message(s1, "MODE #test -k", NOW);

        server.process_message(s1, "MODE #test +i", NOW);
        let replies = server.process_message(s2, "JOIN #test", NOW);
        assert!(lines_for(&replies, s2)[0].contains(" 473 "));
        server.process_message(s1, "INVITE bob #test", NOW);
        let replies = server.process_message(s2, "JOIN #test", NOW);
        assert!(lines_for(&replies, s2)[0].ends_with("JOIN #test"));
        server.process_message(s2, "PART #test", NOW);
        server.process_message(s1, "MODE #test -i", NOW);

        server.process_message(s1, "MODE #test +b bob!*@*", NOW);
        let replies = server.process_message(s2, "JOIN #test", NOW);
        assert!(lines_for(&replies, s2)[0].contains(" 474 "));
        server.process_message(s1, "MODE #test -b bob!*@*", NOW);

        server.process_message(s1, "MODE #test +l 1", NOW);
        let replies = server.process_message(s2, "JOIN #test", NOW);
        assert!(lines_for(&replies, s2)[0].contains(" 471 "));
    }

    #[test]
    fn test_kick() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        let s2 = register(&mut server, 2, "bob");
        server.process_message(s1, "JOIN #test", NOW);
        server.process_message(s2, "JOIN #test", NOW);
        let replies = server.process_message(s1, "KICK #test bob :out", NOW);
        // bob is still interested in his own removal.
        assert_eq!(
            lines_for(&replies, s2),
            vec![":alice!~alice@robust/0x1 KICK #test bob :out"]
        );
        assert!(!server.channel_by_name("#test").unwrap().members.contains_key(&s2));
        assert!(!server.sessions[&s2].channels.contains("#test"));
    }

    #[test]
    fn test_ison_and_away() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        register(&mut server, 2, "bob");
        let replies = server.process_message(s1, "ISON bob ghost alice", NOW);
        assert!(lines_for(&replies, s1)[0].contains(" 303 alice :bob alice"));

        let replies = server.process_message(s1, "AWAY :brb", NOW);
        assert!(lines_for(&replies, s1)[0].contains(" 306 "));
        let replies = server.process_message(s1, "AWAY", NOW);
        assert!(lines_for(&replies, s1)[0].contains(" 305 "));
    }

    #[test]
    fn test_whois() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        let s2 = register(&mut server, 2, "bob");
        server.process_message(s2, "JOIN #test", NOW);
        let replies = server.process_message(s1, "WHOIS bob", NOW);
        let lines = lines_for(&replies, s1);
        assert!(lines[0].contains(" 311 alice bob ~bob robust/0x2 * :bob"));
        assert!(lines.iter().any(|l| l.contains(" 319 alice bob :@#test")));
        assert!(lines.last().unwrap().contains(" 318 "));
    }

    #[test]
    fn test_oper_and_kill() {
        let mut server = server();
        server.config.operators.insert("mero".into(), "s3cure".into());
        let s1 = register(&mut server, 1, "alice");
        let s2 = register(&mut server, 2, "bob");

        let replies = server.process_message(s1, "KILL bob :flood", NOW);
        assert!(lines_for(&replies, s1)[0].contains(" 481 "));

        let replies = server.process_message(s1, "OPER mero wrong", NOW);
        assert!(lines_for(&replies, s1)[0].contains(" 464 "));
        let replies = server.process_message(s1, "OPER mero s3cure", NOW);
        assert!(lines_for(&replies, s1)[0].contains(" 381 "));

        let replies = server.process_message(s1, "KILL bob :flood", NOW);
        assert!(lines_for(&replies, s2)[0].starts_with("ERROR :Closing Link: Killed by alice"));
        assert!(server.session_by_id(s2).is_none());
    }

    #[test]
    fn test_nick_uniqueness_invariant() {
        let mut server = server();
        register(&mut server, 1, "alice");
        register(&mut server, 2, "bob");
        server.process_message(SessionId(2), "NICK alice", NOW);
        let folded: Vec<String> = server
            .sessions
            .values()
            .filter(|s| !s.nick.is_empty())
            .map(|s| robust_proto::irc_to_lower(&s.nick))
            .collect();
        let mut deduped = folded.clone();
        deduped.dedup();
        assert_eq!(folded, deduped);
    }

    #[test]
    fn test_membership_symmetry_invariant() {
        let mut server = server();
        let s1 = register(&mut server, 1, "alice");
        let s2 = register(&mut server, 2, "bob");
        server.process_message(s1, "JOIN #a,#b", NOW);
        server.process_message(s2, "JOIN #b", NOW);
        server.process_message(s1, "PART #a", NOW);
        for (name, channel) in &server.channels {
            for member in channel.member_ids() {
                assert!(server.sessions[&member].channels.contains(name));
            }
        }
        for session in server.sessions.values() {
            for name in &session.channels {
                assert!(server.channels[name].members.contains_key(&session.id));
            }
        }
    }
}
