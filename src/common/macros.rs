//! Useful macros.

/// Time the given operation and push `(label, duration)` to the given `Vec<(&str, Duration)>`.
/// Evaluates to the result of the operation.
macro_rules! time {
    ($timers:ident, $label:literal, $expr:expr) => {{
        let start = std::time::Instant::now();
        let result = $expr;
        $timers.push(($label, start.elapsed()));
        result
    }};
}

/// Join the given path components with `/` into a remote path string. Local paths should use
/// `std::path::Path::join` instead.
macro_rules! dir {
    ($first:expr $(, $part:expr)* $(,)?) => {{
        #[allow(unused_mut)]
        let mut path = String::from($first);

        $(
            if !path.ends_with('/') {
                path.push('/');
            }
            path.push_str(&String::from($part));
        )*

        path
    }}
}

#[cfg(test)]
mod test {
    #[test]
    fn dir_joins_components() {
        assert_eq!(dir!("/root"), "/root");
        assert_eq!(dir!("/root", "sgcb", "log"), "/root/sgcb/log");
        assert_eq!(dir!("/root/", "csv/", "x.csv"), "/root/csv/x.csv");
    }

    #[test]
    fn time_records_label() {
        let mut timers = vec![];
        let value = time!(timers, "answer", 6 * 7);

        assert_eq!(value, 42);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].0, "answer");
    }
}
