//! Unified diff helpers.

/// Extract the files named by a unified diff.
///
/// Every `--- a/<path>` and `+++ b/<path>` header names one file. Paths are
/// returned once each, in the order they first appear. `/dev/null` sides of
/// added or deleted files are not headers of that form and are skipped.
pub fn files_in_patch(patch: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for line in patch.lines() {
        let Some(path) = line
            .strip_prefix("--- a/")
            .or_else(|| line.strip_prefix("+++ b/"))
        else {
            continue;
        };
        let path = path.trim_end_matches('\r');
        if path.is_empty() {
            continue;
        }
        if !files.iter().any(|existing| existing == path) {
            files.push(path.to_string());
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_FILE_PATCH: &str = "\
diff --git a/src/x.py b/src/x.py
index 1111111..2222222 100644
--- a/src/x.py
+++ b/src/x.py
@@ -1 +1 @@
-old
+new
diff --git a/README.md b/README.md
--- a/README.md
+++ b/README.md
@@ -1 +1 @@
-a
+b
";

    #[test]
    fn files_in_patch_deduplicates_header_pairs_in_order() {
        assert_eq!(files_in_patch(TWO_FILE_PATCH), vec!["src/x.py", "README.md"]);
    }

    #[test]
    fn files_in_patch_reports_a_file_touched_twice_once() {
        let patch = format!("{}{}", "--- a/x.py\n+++ b/x.py\n", "--- a/x.py\n+++ b/x.py\n");
        assert_eq!(files_in_patch(&patch), vec!["x.py"]);
    }

    #[test]
    fn files_in_patch_is_idempotent_over_its_own_output() {
        let first = files_in_patch(TWO_FILE_PATCH);
        let second = files_in_patch(TWO_FILE_PATCH);
        assert_eq!(first, second);
    }

    #[test]
    fn files_in_patch_handles_new_and_deleted_files() {
        let patch = "\
--- /dev/null
+++ b/new_module.py
@@ -0,0 +1 @@
+x = 1
--- a/gone.py
+++ /dev/null
@@ -1 +0,0 @@
-y = 2
";
        assert_eq!(files_in_patch(patch), vec!["new_module.py", "gone.py"]);
    }

    #[test]
    fn files_in_patch_ignores_content_lines_and_empty_input() {
        assert!(files_in_patch("").is_empty());
        assert!(files_in_patch("+ added line\n- removed line\n").is_empty());
    }
}
