#![allow(unused_macros)]
///
/// **Note**: These macros (`agent_info!`, `agent_warn!`, `agent_debug!`, and
/// `agent_error!`) are for diagnostics of the agent core itself. They are not
/// designed for general application logging and must never panic or otherwise
/// alter the control flow of instrumented code.
///
/// When running tests with `--nocapture`, these macros print their output to
/// stdout, which is useful for debugging test failures.
///
/// Macro for logging informational messages.
///
/// # Fields:
/// - `name`: The operation or action being logged.
/// - Additional optional key-value pairs can be passed as attributes.
///
/// # Example:
/// ```rust
/// use spancore::agent_info;
/// agent_info!(name: "agent_start", version = "1.0.0");
/// ```
#[macro_export]
macro_rules! agent_info {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::info!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(test)]
        {
            print!("agent_info: name={}\n", $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name; // Compiler will optimize this out as it's unused.
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::info!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name, $($key = $value),+);
        }

        #[cfg(test)]
        {
            print!("agent_info: name={}", $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )+
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $($value),+); // Compiler will optimize this out as it's unused.
        }
    };
}

/// Macro for logging warning messages.
///
/// Used where an internal operation failed in a way that degrades telemetry
/// quality but must not propagate to the instrumented application.
///
/// # Example:
/// ```rust
/// use spancore::agent_warn;
/// agent_warn!(name: "report_failed", error_code = 404);
/// ```
#[macro_export]
macro_rules! agent_warn {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::warn!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(test)]
        {
            print!("agent_warn: name={}\n", $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name; // Compiler will optimize this out as it's unused.
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::warn!(name: $name,
                            target: env!("CARGO_PKG_NAME"),
                            name = $name,
                            $($key = {
                                    $value
                            }),+,
                    )
        }

        #[cfg(test)]
        {
            print!("agent_warn: name={}", $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )+
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $($value),+); // Compiler will optimize this out as it's unused.
        }
    };
}

/// Macro for logging debug messages.
///
/// # Example:
/// ```rust
/// use spancore::agent_debug;
/// agent_debug!(name: "span_entered", layer = "http");
/// ```
#[macro_export]
macro_rules! agent_debug {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::debug!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(test)]
        {
            print!("agent_debug: name={}\n", $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name; // Compiler will optimize this out as it's unused.
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::debug!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name, $($key = $value),+);
        }

        #[cfg(test)]
        {
            print!("agent_debug: name={}", $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )+
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $($value),+); // Compiler will optimize this out as it's unused.
        }
    };
}

/// Macro for logging error messages.
///
/// # Example:
/// ```rust
/// use spancore::agent_error;
/// agent_error!(name: "context_poisoned");
/// ```
#[macro_export]
macro_rules! agent_error {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::error!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(test)]
        {
            print!("agent_error: name={}\n", $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name; // Compiler will optimize this out as it's unused.
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::error!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name, $($key = $value),+);
        }

        #[cfg(test)]
        {
            print!("agent_error: name={}", $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )+
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $($value),+); // Compiler will optimize this out as it's unused.
        }
    };
}
