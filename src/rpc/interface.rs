//! Typed interface glue.
//!
//! [`rpc_interface!`] turns a trait-like method list into everything both
//! sides of a connection need:
//!
//! - a server-side trait whose methods receive the request
//!   [`Context`](crate::context::Context) ahead of the declared arguments;
//! - a client proxy whose methods encode the arguments and return a
//!   [`PendingCall`](crate::rpc::client::PendingCall);
//! - a compile-time FNV-1a/64 hash over each method's rendered signature,
//!   which the server checks so schema-mismatched peers are rejected with
//!   `data_mismatch`;
//! - a `register` function wiring an implementation into a
//!   [`Server`](crate::rpc::server::Server).
//!
//! The proxy method names `new` and `register` are reserved.

/// FNV-1a, 64-bit. Stable across builds, usable in `const` position.
#[must_use]
pub const fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        i += 1;
    }
    hash
}

/// Addresses one remotely callable method: name plus signature hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// The method name as it travels on the wire.
    pub name: &'static str,
    /// FNV-1a/64 over the rendered signature.
    pub hash: u64,
}

impl MethodDescriptor {
    /// Creates a descriptor.
    #[must_use]
    pub const fn new(name: &'static str, hash: u64) -> Self {
        Self { name, hash }
    }
}

/// Declares an RPC interface; see the [module docs](self) for the
/// generated surface.
///
/// ```ignore
/// rpc_interface! {
///     /// Arithmetic over the wire.
///     pub trait Calculator as CalculatorProxy {
///         fn add(a: i32, b: i32) -> i32;
///         fn describe() -> String;
///     }
/// }
/// ```
#[macro_export]
macro_rules! rpc_interface {
    (
        $(#[$meta:meta])*
        $vis:vis trait $trait_name:ident as $proxy_name:ident {
            $(
                $(#[$method_meta:meta])*
                fn $method:ident ( $($arg:ident : $aty:ty),* $(,)? ) -> $ret:ty;
            )*
        }
    ) => {
        $(#[$meta])*
        $vis trait $trait_name: Send + Sync + 'static {
            $(
                $(#[$method_meta])*
                fn $method(
                    &self,
                    ctx: &$crate::context::Context,
                    $($arg: $aty),*
                ) -> $crate::error::Result<$ret>;
            )*
        }

        $(#[$meta])*
        #[derive(Debug)]
        $vis struct $proxy_name {
            object: $crate::rpc::client::RemoteObject,
        }

        impl $proxy_name {
            /// Wraps a remote object handle.
            $vis fn new(object: $crate::rpc::client::RemoteObject) -> Self {
                Self { object }
            }

            $(
                $(#[$method_meta])*
                $vis fn $method(
                    &self,
                    $($arg: $aty),*
                ) -> $crate::error::Result<$crate::rpc::client::PendingCall<$ret>> {
                    const DESC: $crate::rpc::interface::MethodDescriptor =
                        $crate::rpc::interface::MethodDescriptor::new(
                            stringify!($method),
                            $crate::rpc::interface::fnv1a_64(
                                concat!(
                                    stringify!($method),
                                    "(",
                                    $(stringify!($aty), ",",)*
                                    ")->",
                                    stringify!($ret)
                                )
                                .as_bytes(),
                            ),
                        );
                    self.object
                        .async_call::<($($aty,)*), $ret>(&DESC, ($($arg,)*))
                }
            )*

            /// Registers an implementation with a server under
            /// `object_name`.
            $vis fn register<T: $trait_name>(
                server: &$crate::rpc::server::Server,
                object_name: &str,
                implementation: ::std::sync::Arc<T>,
            ) -> $crate::error::Result<()> {
                $(
                {
                    const DESC: $crate::rpc::interface::MethodDescriptor =
                        $crate::rpc::interface::MethodDescriptor::new(
                            stringify!($method),
                            $crate::rpc::interface::fnv1a_64(
                                concat!(
                                    stringify!($method),
                                    "(",
                                    $(stringify!($aty), ",",)*
                                    ")->",
                                    stringify!($ret)
                                )
                                .as_bytes(),
                            ),
                        );
                    let implementation = ::std::sync::Arc::clone(&implementation);
                    server.register_method(
                        object_name,
                        DESC.name,
                        DESC.hash,
                        ::std::sync::Arc::new(
                            move |ctx: &$crate::context::Context,
                                  args: &mut $crate::wire::WireReader<'_>|
                                  -> $crate::error::Result<::std::vec::Vec<u8>> {
                                let ($($arg,)*): ($($aty,)*) =
                                    $crate::wire::Wire::decode(args).map_err(|e| {
                                        $crate::error::Error::invalid_argument(format!(
                                            "argument decoding failed: {e}"
                                        ))
                                    })?;
                                if !args.is_empty() {
                                    return Err($crate::error::Error::invalid_argument(
                                        "trailing bytes after arguments",
                                    ));
                                }
                                let value = implementation.$method(ctx, $($arg),*)?;
                                Ok($crate::wire::to_bytes(&value))
                            },
                        ),
                    )?;
                }
                )*
                Ok(())
            }
        }
    };
}
