//! Instructions sent to the coding agent.

const ISSUE_PREAMBLE: &str = "Below is a real GitHub issue from a popular GitHub repository.
The issue was filed some time ago.
The repo has been checked out at the commit that existed at the moment the issue was filed.
If you are already familiar with this repo, be cautious!
You are working with an old version of the repo!
Filenames, directory names, file contents, etc may be different than what you're used to.

Propose changes to update the repo to fix the problem below.

#";

/// Sent once when the agent finished its first turn without naming any file.
pub const NAME_FILES_FOLLOW_UP: &str = "You haven't named any files in this repo.
Remember, this repo is checked out at quite an old commit.
So the file layout and contents may be unfamiliar.

Tell me: which 3-5 files from this repo should I look at to solve the problem?
";

pub fn initial_instruction(problem_statement: &str) -> String {
    let mut message = String::with_capacity(ISSUE_PREAMBLE.len() + problem_statement.len());
    message.push_str(ISSUE_PREAMBLE);
    message.push_str(problem_statement);
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_instruction_appends_problem_after_preamble() {
        let message = initial_instruction("Crash when parsing empty input");
        assert!(message.starts_with("Below is a real GitHub issue"));
        assert!(message.ends_with("#Crash when parsing empty input"));
        assert!(message.contains("old version of the repo"));
    }

    #[test]
    fn follow_up_asks_for_a_handful_of_files() {
        assert!(NAME_FILES_FOLLOW_UP.contains("3-5 files"));
    }
}
