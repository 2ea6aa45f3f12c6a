//! Splitting of user-supplied command lines (`--planner-cmd "python plan.py"`).

/// Split `input` into program arguments.
///
/// Whitespace separates arguments; single and double quotes group, and a
/// backslash escapes the next character outside single quotes. Quotes are
/// removed from the returned arguments.
///
/// ```rust
/// use cadence_util::split_command_line;
///
/// assert_eq!(
///     split_command_line(r#"python3 "my planner.py" --model 'a b'"#),
///     vec!["python3", "my planner.py", "--model", "a b"]
/// );
/// ```
pub fn split_command_line(input: &str) -> Vec<String> {
    let mut arguments = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_single_quotes = false;
    let mut in_double_quotes = false;
    let mut characters = input.chars();

    while let Some(character) = characters.next() {
        match character {
            '\\' if !in_single_quotes => {
                if let Some(escaped) = characters.next() {
                    current.push(escaped);
                }
                in_token = true;
            }
            '\'' if !in_double_quotes => {
                in_single_quotes = !in_single_quotes;
                in_token = true;
            }
            '"' if !in_single_quotes => {
                in_double_quotes = !in_double_quotes;
                in_token = true;
            }
            c if c.is_whitespace() && !in_single_quotes && !in_double_quotes => {
                if in_token {
                    arguments.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if in_token {
        arguments.push(current);
    }
    arguments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_quotes_yield_empty_argument() {
        assert_eq!(split_command_line("run ''"), vec!["run", ""]);
    }

    #[test]
    fn escaped_spaces_stay_in_one_argument() {
        assert_eq!(split_command_line(r"cat path\ with\ spaces"), vec!["cat", "path with spaces"]);
    }

    #[test]
    fn blank_input_has_no_arguments() {
        assert!(split_command_line("   ").is_empty());
    }
}
