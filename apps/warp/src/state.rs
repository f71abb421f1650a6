//! Client-side shadow of a warp's state.
//!
//! Every endpoint mirrors the relay's snapshots into one of these. The host
//! treats its own shadow as the source of truth for modes: snapshots merged
//! with `hosting = true` never overwrite locally computed modes, so a
//! misbehaving relay cannot grant itself or anyone else write access on the
//! host's behalf.

use std::collections::{BTreeMap, HashMap};

use warp_proto::{Hello, Mode, Role, User, WarpState, WindowSize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("warp token mismatch: {0}")]
    WarpMismatch(String),
    #[error("user token mismatch: {key} <> {user}")]
    UserTokenMismatch { key: String, user: String },
    #[error("unexpected hosting user update: {0}")]
    UnexpectedHostingUser(String),
    #[error("unexpected mode for joining user {user}: {mode:?}")]
    UnexpectedUserMode { user: String, mode: Mode },
    #[error("unknown user: {0}")]
    UnknownUser(String),
}

#[derive(Debug, Clone)]
struct UserState {
    token: String,
    username: String,
    mode: Mode,
    hosting: bool,
}

/// Not thread-safe on its own; the owning [`crate::session::Session`] guards
/// it with its lock.
#[derive(Debug)]
pub struct WarpShadow {
    token: String,
    window_size: WindowSize,
    users: HashMap<String, UserState>,
}

impl WarpShadow {
    /// Initialize from the hello this endpoint sent: a single user, hosting
    /// iff the session role is host.
    pub fn new(hello: &Hello) -> WarpShadow {
        let (mode, hosting) = match hello.role {
            Role::Host => (Mode::HOST_DEFAULT, true),
            _ => (Mode::USER_DEFAULT, false),
        };
        let mut users = HashMap::new();
        users.insert(
            hello.from.user.clone(),
            UserState {
                token: hello.from.user.clone(),
                username: hello.username.clone(),
                mode,
                hosting,
            },
        );
        WarpShadow {
            token: hello.warp.clone(),
            window_size: WindowSize::default(),
            users,
        }
    }

    /// Merge a received snapshot.
    ///
    /// With `hosting = true` the relay is not trusted with modes: joining
    /// users must arrive with the default user mode and no hosting flag, and
    /// existing users keep their locally computed mode.
    pub fn update(&mut self, state: &WarpState, hosting: bool) -> Result<(), StateError> {
        if state.warp != self.token {
            return Err(StateError::WarpMismatch(state.warp.clone()));
        }

        self.window_size = state.window_size;

        for (token, user) in &state.users {
            if *token != user.token {
                return Err(StateError::UserTokenMismatch {
                    key: token.clone(),
                    user: user.token.clone(),
                });
            }
            match self.users.get_mut(token) {
                None => {
                    if hosting && user.hosting {
                        return Err(StateError::UnexpectedHostingUser(token.clone()));
                    }
                    if hosting && user.mode != Mode::USER_DEFAULT {
                        return Err(StateError::UnexpectedUserMode {
                            user: token.clone(),
                            mode: user.mode,
                        });
                    }
                    self.users.insert(
                        token.clone(),
                        UserState {
                            token: token.clone(),
                            username: user.username.clone(),
                            mode: if hosting { Mode::USER_DEFAULT } else { user.mode },
                            hosting: user.hosting,
                        },
                    );
                }
                Some(entry) => {
                    entry.username = user.username.clone();
                    if !hosting {
                        entry.mode = user.mode;
                    }
                }
            }
        }

        self.users.retain(|token, _| state.users.contains_key(token));

        Ok(())
    }

    pub fn get_mode(&self, user: &str) -> Result<Mode, StateError> {
        self.users
            .get(user)
            .map(|entry| entry.mode)
            .ok_or_else(|| StateError::UnknownUser(user.to_string()))
    }

    pub fn set_mode(&mut self, user: &str, mode: Mode) -> Result<(), StateError> {
        match self.users.get_mut(user) {
            Some(entry) => {
                entry.mode = mode;
                Ok(())
            }
            None => Err(StateError::UnknownUser(user.to_string())),
        }
    }

    /// Whether any non-hosting user currently holds write access. The host
    /// gates inbound network bytes on this before they touch the pty.
    pub fn host_can_receive_write(&self) -> bool {
        self.users
            .values()
            .any(|user| !user.hosting && user.mode.contains(Mode::SHELL_WRITE))
    }

    pub fn window_size(&self) -> WindowSize {
        self.window_size
    }

    /// Modes of all non-hosting users, as carried in a host update.
    pub fn modes(&self) -> BTreeMap<String, Mode> {
        self.users
            .values()
            .filter(|user| !user.hosting)
            .map(|user| (user.token.clone(), user.mode))
            .collect()
    }

    pub fn snapshot(&self) -> WarpState {
        let users = self
            .users
            .values()
            .map(|user| {
                (
                    user.token.clone(),
                    User {
                        token: user.token.clone(),
                        username: user.username.clone(),
                        mode: user.mode,
                        hosting: user.hosting,
                    },
                )
            })
            .collect();
        WarpState {
            warp: self.token.clone(),
            window_size: self.window_size,
            users,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warp_proto::SessionIdentity;

    fn hello(role: Role) -> Hello {
        Hello {
            warp: "demo".into(),
            from: SessionIdentity {
                token: "session_1".into(),
                user: "self_user".into(),
                secret: "s".into(),
            },
            version: warp_proto::VERSION.into(),
            role,
            username: "alice".into(),
        }
    }

    fn user(token: &str, mode: Mode, hosting: bool) -> User {
        User {
            token: token.into(),
            username: token.into(),
            mode,
            hosting,
        }
    }

    fn snapshot(users: Vec<User>) -> WarpState {
        WarpState {
            warp: "demo".into(),
            window_size: WindowSize { rows: 24, cols: 80 },
            users: users.into_iter().map(|u| (u.token.clone(), u)).collect(),
        }
    }

    #[test]
    fn host_hello_seeds_hosting_user() {
        let shadow = WarpShadow::new(&hello(Role::Host));
        assert_eq!(shadow.get_mode("self_user").unwrap(), Mode::HOST_DEFAULT);
        assert!(!shadow.host_can_receive_write());
    }

    #[test]
    fn client_hello_seeds_read_only_user() {
        let shadow = WarpShadow::new(&hello(Role::ShellClient));
        assert_eq!(shadow.get_mode("self_user").unwrap(), Mode::USER_DEFAULT);
    }

    #[test]
    fn warp_mismatch_is_rejected() {
        let mut shadow = WarpShadow::new(&hello(Role::Host));
        let mut state = snapshot(vec![user("self_user", Mode::HOST_DEFAULT, true)]);
        state.warp = "other".into();
        assert!(matches!(
            shadow.update(&state, true),
            Err(StateError::WarpMismatch(_))
        ));
    }

    #[test]
    fn key_token_mismatch_is_rejected() {
        let mut shadow = WarpShadow::new(&hello(Role::Host));
        let mut state = snapshot(vec![user("self_user", Mode::HOST_DEFAULT, true)]);
        state
            .users
            .insert("mismatch".into(), user("someone_else", Mode::USER_DEFAULT, false));
        assert!(matches!(
            shadow.update(&state, true),
            Err(StateError::UserTokenMismatch { .. })
        ));
    }

    #[test]
    fn hosting_shadow_rejects_new_hosting_user() {
        let mut shadow = WarpShadow::new(&hello(Role::Host));
        let state = snapshot(vec![
            user("self_user", Mode::HOST_DEFAULT, true),
            user("imposter", Mode::USER_DEFAULT, true),
        ]);
        assert_eq!(
            shadow.update(&state, true),
            Err(StateError::UnexpectedHostingUser("imposter".into()))
        );
    }

    #[test]
    fn hosting_shadow_rejects_elevated_joiner() {
        let mut shadow = WarpShadow::new(&hello(Role::Host));
        let state = snapshot(vec![
            user("self_user", Mode::HOST_DEFAULT, true),
            user("sneaky", Mode::HOST_DEFAULT, false),
        ]);
        assert!(matches!(
            shadow.update(&state, true),
            Err(StateError::UnexpectedUserMode { .. })
        ));
    }

    #[test]
    fn hosting_shadow_preserves_local_modes() {
        let mut shadow = WarpShadow::new(&hello(Role::Host));
        let state = snapshot(vec![
            user("self_user", Mode::HOST_DEFAULT, true),
            user("viewer", Mode::USER_DEFAULT, false),
        ]);
        shadow.update(&state, true).unwrap();

        // Host grants write locally.
        shadow
            .set_mode("viewer", Mode::USER_DEFAULT.with(Mode::SHELL_WRITE))
            .unwrap();
        assert!(shadow.host_can_receive_write());

        // A lying relay claiming the viewer is read-only must not downgrade
        // the host's local view... nor can it grant writes on its own.
        let lying = snapshot(vec![
            user("self_user", Mode::HOST_DEFAULT, true),
            user("viewer", Mode::USER_DEFAULT, false),
        ]);
        shadow.update(&lying, true).unwrap();
        assert!(shadow.host_can_receive_write());
        assert_eq!(
            shadow.get_mode("viewer").unwrap(),
            Mode::USER_DEFAULT.with(Mode::SHELL_WRITE)
        );
    }

    #[test]
    fn client_shadow_accepts_relay_modes_verbatim() {
        let mut shadow = WarpShadow::new(&hello(Role::ShellClient));
        let state = snapshot(vec![
            user("self_user", Mode::HOST_DEFAULT, false),
            user("host_user", Mode::HOST_DEFAULT, true),
        ]);
        shadow.update(&state, false).unwrap();
        assert_eq!(shadow.get_mode("self_user").unwrap(), Mode::HOST_DEFAULT);
        assert!(shadow.get_mode("host_user").unwrap().contains(Mode::SHELL_WRITE));
    }

    #[test]
    fn absent_users_are_removed() {
        let mut shadow = WarpShadow::new(&hello(Role::Host));
        let joined = snapshot(vec![
            user("self_user", Mode::HOST_DEFAULT, true),
            user("viewer", Mode::USER_DEFAULT, false),
        ]);
        shadow.update(&joined, true).unwrap();
        assert!(shadow.get_mode("viewer").is_ok());

        let left = snapshot(vec![user("self_user", Mode::HOST_DEFAULT, true)]);
        shadow.update(&left, true).unwrap();
        assert!(matches!(
            shadow.get_mode("viewer"),
            Err(StateError::UnknownUser(_))
        ));
    }

    #[test]
    fn window_size_follows_snapshots() {
        let mut shadow = WarpShadow::new(&hello(Role::ShellClient));
        let mut state = snapshot(vec![user("self_user", Mode::USER_DEFAULT, false)]);
        state.window_size = WindowSize { rows: 50, cols: 132 };
        shadow.update(&state, false).unwrap();
        assert_eq!(shadow.window_size(), WindowSize { rows: 50, cols: 132 });
    }

    #[test]
    fn modes_exclude_the_hosting_user() {
        let mut shadow = WarpShadow::new(&hello(Role::Host));
        let state = snapshot(vec![
            user("self_user", Mode::HOST_DEFAULT, true),
            user("viewer", Mode::USER_DEFAULT, false),
        ]);
        shadow.update(&state, true).unwrap();
        let modes = shadow.modes();
        assert_eq!(modes.len(), 1);
        assert_eq!(modes["viewer"], Mode::USER_DEFAULT);
    }

    #[test]
    fn snapshot_update_round_trip_is_stable() {
        let mut shadow = WarpShadow::new(&hello(Role::ShellClient));
        let state = snapshot(vec![
            user("self_user", Mode::USER_DEFAULT, false),
            user("host_user", Mode::HOST_DEFAULT, true),
        ]);
        shadow.update(&state, false).unwrap();
        let first = shadow.snapshot();
        shadow.update(&first, false).unwrap();
        assert_eq!(shadow.snapshot(), first);
    }
}
