use crate::{
    narrator::{client::ChatMessage, parse::OPTION_COUNT},
    state::session::{START_ACTION, StorySegment},
};

/// Build the system and user messages for one narration call.
pub fn build_messages(
    region: &str,
    flavor: &str,
    recent: &[StorySegment],
    action: &str,
) -> Vec<ChatMessage> {
    let setting = if flavor.is_empty() {
        region.to_owned()
    } else {
        format!("{region}: {flavor}")
    };
    let system = format!(
        "You are the narrator of a collaborative story played by a small group. \
         The story takes place in {setting}. Write the next scene in two to four vivid \
         sentences addressed to the group, then offer exactly {OPTION_COUNT} short, distinct \
         actions the group could take next. Reply with a JSON object only: \
         {{\"text\": \"<scene>\", \"options\": [\"<action>\", \"<action>\", \"<action>\"]}}"
    );

    let mut user = String::new();
    if !recent.is_empty() {
        user.push_str("Story so far:\n");
        for segment in recent {
            if segment.chosen_action != START_ACTION {
                user.push_str(&format!("(The group chose: {})\n", segment.chosen_action));
            }
            user.push_str(&segment.text);
            user.push('\n');
        }
        user.push('\n');
    }
    if action == START_ACTION {
        user.push_str("Open the story with its first scene.");
    } else {
        user.push_str(&format!("The group chose: {action}. Continue the story."));
    }

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}
