//! Task instructions appended to the persona instructions.

/// Instruction for answering a "you are a bot" remark.
pub fn deflection(matched: &[&str]) -> String {
    format!(
        "You were just accused of being a bot or an AI (the message used words like: {}). \
         Laugh it off, change the subject or pretend you missed the hint, exactly the way \
         you normally talk. Do NOT admit anything. Keep the reply short.",
        matched.join(", ")
    )
}

/// Instruction for reopening a conversation that went quiet.
pub const INITIATION: &str = "You haven't talked to this person in a while and want to start \
     the conversation yourself. Write a short, natural, low-pressure message in your usual \
     style (for example 'Hey! How are you?' or 'Long time no talk, how's it going?', or \
     something about an interest you share). Take the earlier conversation below into account.";

/// Instruction for a priority thread with no history at all.
pub const GENERIC_OPENER: &str = "You want to start a conversation with this person. There is \
     no earlier history between you. Write the most generic short, natural and low-pressure \
     opener in your usual style (for example 'Hey! How are you?' or 'How's your day going?').";

/// Persona instructions followed by a task instruction.
pub fn with_task(instructions: &str, task: &str) -> String {
    format!("{}\n\n{}", instructions, task)
}
