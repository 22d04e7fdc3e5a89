use rand::seq::SliceRandom;

const NAME_PLACEHOLDER: &str = "{name}";

struct KeywordReplies {
    keywords: &'static [&'static str],
    variants: &'static [&'static str],
}

struct ReplyBank {
    /// Lowercase fragments matched against the assistant's display name.
    names: &'static [&'static str],
    keyword_replies: &'static [KeywordReplies],
    default_variants: &'static [&'static str],
}

const IT_SUPPORT: ReplyBank = ReplyBank {
    names: &["it support", "it helpdesk", "tech support"],
    keyword_replies: &[
        KeywordReplies {
            keywords: &["password", "locked out", "login"],
            variants: &[
                "To reset your password, open the self-service portal, choose \"Forgot password\" and follow the verification steps. The new password needs at least 12 characters and cannot repeat any of your last five.",
                "Accounts lock for 15 minutes after five failed sign-in attempts. You can wait it out, or reset your password from the self-service portal right away and I'll walk you through it.",
            ],
        },
        KeywordReplies {
            keywords: &["vpn", "remote access"],
            variants: &[
                "For VPN trouble, first quit the VPN client completely and reconnect. If it still fails, check that your device clock is correct and that you are on a network that allows outbound UDP 443.",
                "Most VPN issues come from an expired certificate. Open the VPN client, choose \"Renew certificate\", sign in again and reconnect.",
            ],
        },
        KeywordReplies {
            keywords: &["printer", "print"],
            variants: &[
                "Let's get that printer working. Make sure it shows as online, clear any stuck jobs from the print queue, then remove and re-add the printer from the company printer list.",
                "Printer problems are usually a stuck queue. Cancel all pending jobs, power-cycle the printer and send a single test page.",
            ],
        },
        KeywordReplies {
            keywords: &["email", "outlook", "mailbox"],
            variants: &[
                "For email issues, check whether webmail works. If it does, the problem is your local client: restart it and rebuild the offline cache from the account settings.",
                "If mail is not arriving, check your mailbox quota first; a full mailbox silently rejects new messages. Archiving older folders usually fixes it.",
            ],
        },
        KeywordReplies {
            keywords: &["slow", "freez", "performance"],
            variants: &[
                "A slow machine usually has too much running at startup. Restart it, then open the task manager and look for anything using a lot of CPU or memory.",
                "Try a full restart and install pending updates. If it is still slow afterwards, tell me the device name and I'll open a hardware ticket.",
            ],
        },
    ],
    default_variants: &[
        "Hello! I'm your IT Support assistant. I can help with account access, VPN, printers, email and slow computers. What's going on today?",
        "Hi there, IT Support here. Tell me what isn't working and I'll walk you through the fix step by step.",
    ],
};

const HR_ASSISTANT: ReplyBank = ReplyBank {
    names: &["hr", "human resources", "people"],
    keyword_replies: &[
        KeywordReplies {
            keywords: &["vacation", "leave", "holiday", "time off"],
            variants: &[
                "Full-time employees accrue 25 days of paid leave per year. Submit requests in the HR portal at least two weeks ahead so your manager can approve them.",
                "You can check your remaining leave balance in the HR portal under \"Time off\". Requests longer than ten days need manager approval a month in advance.",
            ],
        },
        KeywordReplies {
            keywords: &["benefit", "insurance", "pension"],
            variants: &[
                "Benefits enrollment opens every November. Outside that window you can change coverage only after a qualifying life event.",
                "The benefits overview in the HR portal lists health, dental and pension options along with the company contribution for each.",
            ],
        },
        KeywordReplies {
            keywords: &["payroll", "salary", "payslip"],
            variants: &[
                "Salaries are paid on the 25th of each month. Payslips appear in the HR portal two days before payday.",
                "For payroll corrections, open a ticket with the payroll team before the 15th so the fix lands in this month's run.",
            ],
        },
    ],
    default_variants: &[
        "Hello! I'm the HR Assistant. Ask me about leave, benefits, payroll or company policies.",
        "Hi, HR here. What can I help you with today: time off, benefits, payroll or something else?",
    ],
};

const SALES_ASSISTANT: ReplyBank = ReplyBank {
    names: &["sales"],
    keyword_replies: &[
        KeywordReplies {
            keywords: &["price", "pricing", "cost", "quote"],
            variants: &[
                "Our pricing is tiered by seat count. I can prepare a quote if you tell me the number of users and the billing period you prefer.",
                "List prices are on the pricing page; volume discounts start at 50 seats. Want me to draft a quote?",
            ],
        },
        KeywordReplies {
            keywords: &["demo", "trial"],
            variants: &[
                "I can set up a 14-day trial with full features. Share the company name and an admin email and I'll get it started.",
                "Demos run 30 minutes and can be tailored to your use case. Which days work best for you?",
            ],
        },
    ],
    default_variants: &[
        "Hi! I'm the Sales Assistant. I can help with pricing, quotes, demos and trials.",
        "Hello, Sales here. Are you exploring options, comparing plans or ready for a quote?",
    ],
};

const MARKETING_ASSISTANT: ReplyBank = ReplyBank {
    names: &["marketing"],
    keyword_replies: &[
        KeywordReplies {
            keywords: &["campaign", "launch"],
            variants: &[
                "For a campaign, start with one audience, one message and one channel. Tell me the goal and I'll sketch a plan with milestones.",
                "A good launch plan covers positioning, channels, assets and a measurement plan. Which of those should we start with?",
            ],
        },
        KeywordReplies {
            keywords: &["social", "post", "linkedin"],
            variants: &[
                "Short posts with a clear hook perform best. Share the topic and I'll draft three variants for you to choose from.",
                "For social posts, lead with the benefit, keep it under 200 characters and end with a single call to action.",
            ],
        },
    ],
    default_variants: &[
        "Hello! I'm the Marketing Assistant. I can help with campaigns, copy and social media.",
        "Hi, Marketing here. What are we promoting today?",
    ],
};

const GENERIC: ReplyBank = ReplyBank {
    names: &[],
    keyword_replies: &[],
    default_variants: &[
        "Hello! I'm {name}. How can I help you today?",
        "Hi, this is {name}. Tell me a bit more about what you need and I'll do my best to help.",
    ],
};

const BANKS: &[&ReplyBank] = &[
    &IT_SUPPORT,
    &HR_ASSISTANT,
    &SALES_ASSISTANT,
    &MARKETING_ASSISTANT,
];

/// Canned reply bank used when no remote assistant can answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct CannedResponses;

impl CannedResponses {
    pub fn new() -> Self {
        Self
    }

    /// Every reply the bank could give for this input; `reply` picks one of these.
    pub fn variants_for(&self, user_text: &str, assistant_name: &str) -> Vec<String> {
        let bank = bank_for(assistant_name);
        let user_text = user_text.to_lowercase();

        let variants = bank
            .keyword_replies
            .iter()
            .find(|entry| {
                entry
                    .keywords
                    .iter()
                    .any(|keyword| user_text.contains(keyword))
            })
            .map_or(bank.default_variants, |entry| entry.variants);

        let display_name = display_name(assistant_name);
        variants
            .iter()
            .map(|variant| variant.replace(NAME_PLACEHOLDER, display_name))
            .collect()
    }

    pub fn reply(&self, user_text: &str, assistant_name: &str) -> String {
        let variants = self.variants_for(user_text, assistant_name);
        variants
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| format!("Hello! I'm {}.", display_name(assistant_name)))
    }
}

fn bank_for(assistant_name: &str) -> &'static ReplyBank {
    let name = assistant_name.trim().to_lowercase();
    BANKS
        .iter()
        .copied()
        .find(|bank| bank.names.iter().any(|fragment| name_matches(&name, fragment)))
        .unwrap_or(&GENERIC)
}

// Short fragments like "hr" must match a whole word, not the middle of one.
fn name_matches(name: &str, fragment: &str) -> bool {
    if fragment.contains(' ') {
        return name.contains(fragment);
    }
    name.split(|character: char| !character.is_alphanumeric())
        .any(|word| word == fragment)
}

fn display_name(assistant_name: &str) -> &str {
    let trimmed = assistant_name.trim();
    if trimmed.is_empty() {
        "your assistant"
    } else {
        trimmed
    }
}
