//! System instruction assembly
//!
//! Both surfaces share the interviewer persona, the practice mode and the
//! feedback depth. Voice calls add speech guidance; text chats label the
//! context as user-provided and spell out missing fields.

use crate::settings::{FeedbackDepth, InterviewSettings, PracticeMode};

const BASE_INSTRUCTION: &str = "\
You are an expert technical interviewer and hiring manager named \"SteadyCoach\".
Your goal is to conduct a realistic, professional, yet supportive job interview via text chat.
You will be provided with the candidate's target role, company (optional), and job description (optional).
Start by briefly introducing yourself and asking the first question.
Wait for the candidate to answer before asking the next question.
Ask follow-up questions based on their answers to dig deeper into their experience.
Keep your responses concise and conversational (under 150 words usually).
If the candidate struggles, offer a small hint or rephrase the question.";

const VOICE_GUIDANCE: &str = "\
You are speaking with the candidate now via a voice call.
Your output must be speech-friendly. Keep sentences moderately short.";

pub fn mode_instruction(mode: PracticeMode) -> &'static str {
    match mode {
        PracticeMode::Structured => "MODE: STRUCTURED INTERVIEW. Take charge of the conversation. Ask one specific question at a time. Maintain a logical flow similar to a real interview.",
        PracticeMode::Refinement => "MODE: ANSWER REFINEMENT. The user will provide answers. Your primary goal is to critique their answer on clarity, structure (STAR method), and impact. Then ask them to try again or ask a follow-up.",
        PracticeMode::Simulation => "MODE: SIMULATION. High pressure. Be stricter with your evaluation. Don't be overly encouraging; be neutral and professional. Ask challenging follow-ups immediately.",
    }
}

pub fn depth_instruction(depth: FeedbackDepth) -> String {
    let guidance = match depth {
        FeedbackDepth::Light => "Be encouraging and gentle.",
        FeedbackDepth::Standard => "Balance encouragement with constructive criticism.",
        FeedbackDepth::Deep => {
            "Be highly critical, point out every flaw, and demand high standards."
        }
    };
    format!(
        "FEEDBACK DEPTH: {}. {}",
        depth.as_str().to_uppercase(),
        guidance
    )
}

fn configuration_block(settings: &InterviewSettings) -> String {
    format!(
        "CONFIGURATION:\n{}\n{}",
        mode_instruction(settings.practice_mode),
        depth_instruction(settings.feedback_depth)
    )
}

/// Instruction for a realtime voice call
pub fn voice_instruction(settings: &InterviewSettings) -> String {
    let mut context = vec![
        "Current Interview Context:".to_string(),
        format!("Target Role: {}", settings.role),
        format!("Experience Level: {}", settings.experience_level),
    ];
    if !settings.company.trim().is_empty() {
        context.push(format!("Target Company: {}", settings.company));
    }
    if !settings.description.trim().is_empty() {
        context.push(format!("Job Context: {}", settings.description));
    }

    [
        BASE_INSTRUCTION.to_string(),
        context.join("\n"),
        configuration_block(settings),
        VOICE_GUIDANCE.to_string(),
    ]
    .join("\n\n")
}

/// System message for a text chat
pub fn text_instruction(settings: &InterviewSettings) -> String {
    let or = |value: &str, fallback: &str| {
        if value.trim().is_empty() {
            fallback.to_string()
        } else {
            value.to_string()
        }
    };

    let context = format!(
        "CONTEXT (User-Provided):\nRole: {}\nExperience: {}\nCompany: {}\nJob Description: {}",
        settings.role,
        settings.experience_level,
        or(&settings.company, "Not specified"),
        or(&settings.description, "N/A"),
    );

    [
        BASE_INSTRUCTION.to_string(),
        context,
        configuration_block(settings),
    ]
    .join("\n\n")
}

/// First user turn that gets a text chat going
pub fn opening_prompt(settings: &InterviewSettings) -> String {
    match settings.practice_mode {
        PracticeMode::Refinement => format!(
            "I am ready to help you refine your answers for a {} position. Please tell me which question you'd like to practice, or paste an answer you've prepared.",
            settings.role
        ),
        _ => format!(
            "Please introduce yourself as \"SteadyCoach\" and start the interview for the {} position. Keep it professional and direct.",
            settings.role
        ),
    }
}
