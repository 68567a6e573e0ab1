//! Message-based error construction shared by the client and server crates.
//!
//! `switchboard-mcp` and `switchboard-server` each own a `thiserror` enum.
//! Both need to wrap a failure from a transport, a codec or a missing
//! session field with a short description of what was being attempted.
//! [`FromMessage`] is the one capability such an enum must offer, and
//! [`impl_context!`] derives the `.context()` helpers from it.

/// An error type with a free-form message variant.
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

/// Define a module-local `Context` trait with `.context()` and
/// `.with_context()` on `Result<T, E: Display>` and `Option<T>`.
///
/// The invoking module must have `Error: FromMessage` and
/// `type Result<T> = std::result::Result<T, Error>` in scope. A wrapped
/// error becomes `"<context>: <source>"`; a `None` becomes `"<context>"`.
///
/// ```ignore
/// // crates/mcp/src/error.rs
/// switchboard_common::impl_context!();
///
/// // crates/mcp/src/connector.rs
/// let url = server.url.as_deref().with_context(|| format!("{name} requires a url"))?;
/// ```
#[macro_export]
macro_rules! impl_context {
    () => {
        pub trait Context<T> {
            fn context(self, context: impl Into<String>) -> Result<T>;
            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C;
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                let ctx = context.into();
                self.map_err(|source| {
                    <Error as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.map_err(|source| {
                    let ctx = f().into();
                    <Error as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(context.into()))
            }

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

#[cfg(test)]
mod tests {
    mod transport {
        #[derive(Debug, thiserror::Error)]
        pub enum Error {
            #[error("{0}")]
            Message(String),
        }

        impl crate::FromMessage for Error {
            fn from_message(message: String) -> Self {
                Self::Message(message)
            }
        }

        pub type Result<T> = std::result::Result<T, Error>;

        crate::impl_context!();
    }

    use transport::Context;

    #[test]
    fn context_prefixes_result_errors() {
        let res: Result<(), &str> = Err("connection reset");
        let err = res.context("sending tools/call").unwrap_err();
        assert_eq!(err.to_string(), "sending tools/call: connection reset");
    }

    #[test]
    fn context_on_none_uses_message() {
        let err = None::<u8>
            .with_context(|| "missing mcp-session-id")
            .unwrap_err();
        assert_eq!(err.to_string(), "missing mcp-session-id");
    }
}
