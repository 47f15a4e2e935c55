//! Prompt templates for action prediction.

/// Build the action-query prompt for an instruction.
///
/// With `enable_cot` the model is asked to reason step by step before
/// emitting the action tokens; without it the action is requested directly.
/// The two variants always differ for the same instruction.
pub fn build_prompt(instruction: &str, enable_cot: bool) -> String {
    let instruction = instruction.trim().trim_end_matches('.').to_lowercase();
    if enable_cot {
        format!(
            "In: What action should the robot take to {instruction}? Think step by step, then answer with the action.\nOut: "
        )
    } else {
        format!("In: What action should the robot take to {instruction}?\nOut: ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_differ() {
        let plain = build_prompt("pick up the red block", false);
        let cot = build_prompt("pick up the red block", true);
        assert_ne!(plain, cot);
        assert!(plain.contains("pick up the red block"));
        assert!(cot.contains("pick up the red block"));
    }

    #[test]
    fn cot_variant_asks_for_reasoning() {
        let cot = build_prompt("close the drawer", true);
        assert!(cot.contains("step by step"));
        assert!(!build_prompt("close the drawer", false).contains("step by step"));
    }

    #[test]
    fn instruction_is_normalized() {
        let prompt = build_prompt("  Pick up the Fork.  ", false);
        assert!(prompt.contains("pick up the fork?"));
    }
}
