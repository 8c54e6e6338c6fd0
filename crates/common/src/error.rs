/// Error types that can be built from a plain message.
///
/// Implement it, then call [`impl_context!`] next to the crate's `Error` and
/// `Result` to get `.context()` and `.with_context()`.
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

#[doc(hidden)]
pub fn prefixed<E: FromMessage>(context: String, source: impl std::fmt::Display) -> E {
    E::from_message(format!("{context}: {source}"))
}

/// Generates a crate-local `Context` trait for `Result` and `Option`.
///
/// ```ignore
/// // crates/config/src/error.rs
/// gskills_common::impl_context!();
/// ```
#[macro_export]
macro_rules! impl_context {
    () => {
        pub trait Context<T>: Sized {
            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C;

            fn context(self, context: impl Into<String>) -> Result<T> {
                let context: String = context.into();
                self.with_context(move || context)
            }
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.map_err(|source| $crate::prefixed::<Error>(f().into(), source))
            }
        }

        impl<T> Context<T> for Option<T> {
            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(f().into()))
            }
        }
    };
}
