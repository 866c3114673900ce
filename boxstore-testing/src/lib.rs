//! Shared fixtures for exercising boxstore
//!
//! Boxes carry a process-unique identity, so every test builds its own
//! [`Fixtures`] and the store that goes with it:
//!
//! ```rust,ignore
//! use boxstore_testing::Fixtures;
//!
//! let fx = Fixtures::new();
//! let store = fx.store()?;
//! store.dispatch(fx.increment.call(2))?;
//! assert_eq!(*store.select(&fx.select_double_count)?, 4);
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

use boxstore::{
    Action, Mutator, Reader, Result, Scope, Selector, SignalFactory, StateBox, Store, StoreError,
    StoreOptions,
};
use serde::{Deserialize, Serialize};

/// Key of the counter box
pub const COUNT_KEY: &str = "count";

/// Key of the current-user box
pub const USER_KEY: &str = "user";

/// Type tag of [`Fixtures::select_current_user`]
pub const CURRENT_USER: &str = "CURRENT_USER";

/// A signed-in user
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct User {
    /// Account id
    pub id: u64,
    /// Given name
    pub first_name: String,
    /// Family name
    pub last_name: String,
}

impl User {
    /// Build a user from its parts
    pub fn new(id: u64, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        User {
            id,
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }

    /// First and last name, space separated
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Persisted form of [`User`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Account id
    pub id: u64,
    /// First and last name
    pub name: [String; 2],
}

impl From<&User> for UserRecord {
    fn from(user: &User) -> Self {
        UserRecord {
            id: user.id,
            name: [user.first_name.clone(), user.last_name.clone()],
        }
    }
}

impl From<UserRecord> for User {
    fn from(record: UserRecord) -> Self {
        let [first_name, last_name] = record.name;
        User {
            id: record.id,
            first_name,
            last_name,
        }
    }
}

/// A full set of boxes, selectors, actions and signals bound together
#[derive(Debug, Clone)]
pub struct Fixtures {
    /// Counter, persisted as a plain number
    pub count: StateBox<i64>,
    /// Current user, persisted through [`UserRecord`]
    pub user: StateBox<User>,

    /// `count += n`
    pub increment: Mutator<i64, i64>,
    /// `count -= n`, refusing to go below zero
    pub decrement: Mutator<i64, i64>,
    /// Replace the first name of the current user
    pub set_first_name: Mutator<User, String>,

    /// The count itself
    pub select_count: Selector<(), i64>,
    /// `count * 2`
    pub select_double_count: Selector<(), i64>,
    /// `count * times`
    pub select_multiple_count: Selector<i64, i64>,
    /// The current user, tagged [`CURRENT_USER`]
    pub select_current_user: Selector<(), User>,
    /// Full name of the current user, through `select_current_user`
    pub select_full_name: Selector<(), String>,

    /// Increment `n` times by one, as separate nested dispatches
    pub increment_times: Action<u32, i64>,
    /// Increment by `n`, then fail
    pub increment_then_fail: Action<i64, ()>,

    /// Rename the current user; also bumps the counter
    pub user_renamed: SignalFactory<String>,
}

impl Fixtures {
    /// Declare a fresh set of boxes and everything bound to them
    pub fn new() -> Self {
        let count = StateBox::new(COUNT_KEY, 0i64);
        let user = StateBox::opaque(USER_KEY, User::default()).portable(
            |user: &User| UserRecord::from(user),
            |record: UserRecord| User::from(record),
        );

        let increment = count.mutator("increment", |n, by: i64| n + by);
        let decrement = count.try_mutator("decrement", |n, by: i64| {
            if *n < by {
                Err(StoreError::msg(format!("cannot take {by} from {n}")))
            } else {
                Ok(n - by)
            }
        });
        let set_first_name = user.mutator("set_first_name", |user, first_name: String| User {
            first_name,
            ..user.clone()
        });

        let select_count = Selector::new({
            let count = count.clone();
            move |reader: &Reader<'_>, _: &()| Ok(*reader.select(&count)?)
        });
        let select_double_count = Selector::new({
            let count = count.clone();
            move |reader: &Reader<'_>, _: &()| Ok(*reader.select(&count)? * 2)
        });
        let select_multiple_count = Selector::new({
            let count = count.clone();
            move |reader: &Reader<'_>, times: &i64| Ok(*reader.select(&count)? * times)
        });
        let select_current_user = Selector::new({
            let user = user.clone();
            move |reader: &Reader<'_>, _: &()| Ok(User::clone(&*reader.select(&user)?))
        })
        .with_type(CURRENT_USER);
        let select_full_name = Selector::new({
            let current = select_current_user.clone();
            move |reader: &Reader<'_>, _: &()| Ok(reader.select(&current)?.full_name())
        });

        let increment_times = Action::new({
            let increment = increment.clone();
            move |scope: &Scope<'_>, times: u32| {
                let mut last = 0;
                for _ in 0..times {
                    last = *scope.dispatch(increment.call(1))?;
                }
                Ok(last)
            }
        })
        .with_type("INCREMENT_TIMES");
        let increment_then_fail = Action::new({
            let increment = increment.clone();
            move |scope: &Scope<'_>, by: i64| -> Result<()> {
                scope.dispatch(increment.call(by))?;
                Err(StoreError::msg("increment rejected after the fact"))
            }
        })
        .with_type("INCREMENT_THEN_FAIL");

        let user_renamed = SignalFactory::new("USER_RENAMED");
        user_renamed.listen(&user, {
            let set_first_name = set_first_name.clone();
            move |scope: &Scope<'_>, _user: &User, first_name: &String| {
                scope.dispatch(set_first_name.call(first_name.clone()))?;
                Ok(())
            }
        });
        user_renamed.listen(&count, {
            let increment = increment.clone();
            move |scope: &Scope<'_>, _count: &i64, _first_name: &String| {
                scope.dispatch(increment.call(1))?;
                Ok(())
            }
        });

        Fixtures {
            count,
            user,
            increment,
            decrement,
            set_first_name,
            select_count,
            select_double_count,
            select_multiple_count,
            select_current_user,
            select_full_name,
            increment_times,
            increment_then_fail,
            user_renamed,
        }
    }

    /// A store with both boxes registered
    pub fn store(&self) -> Result<Store> {
        self.store_with(StoreOptions::new())
    }

    /// A store with both boxes registered and the given options
    pub fn store_with(&self, options: StoreOptions) -> Result<Store> {
        Store::builder()
            .options(options)
            .register(&self.count)
            .register(&self.user)
            .build()
    }
}

impl Default for Fixtures {
    fn default() -> Self {
        Self::new()
    }
}
