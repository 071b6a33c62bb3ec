//! Useful macros.

/// Time the given operations and push the time to the given `Vec<(&str, Duration)>`.
macro_rules! time {
    ($timers:ident, $label:literal, $expr:expr) => {{
        let start = std::time::Instant::now();
        let result = $expr;
        let duration = std::time::Instant::now() - start;
        $timers.push(($label, duration));
        result
    }};
}

/// Build an argv (`Vec<String>`) from anything that implements `ToString`.
macro_rules! argv {
    ($($arg:expr),* $(,)?) => {
        vec![$($arg.to_string()),*]
    };
}
