use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelpEntry {
    pub title: &'static str,
    pub body: &'static str,
    pub tips: &'static [&'static str],
}

pub const NO_HELP: HelpEntry = HelpEntry {
    title: "No help available",
    body: "There is no help text for this topic yet.",
    tips: &[],
};

const TOPICS: &[(&str, HelpEntry)] = &[
    (
        "company_info",
        HelpEntry {
            title: "Company Information",
            body: "Your company profile used across the CRM: on invoices, emails, reports, and client-facing documents.\n\nFields:\n- Company Name: your registered business name\n- Owner Name: primary contact / owner\n- Email: default business email for correspondence\n- Phone: main business phone number\n- Address: registered business address\n- Website: your company website URL",
            tips: &[
                "This info appears on all generated invoices",
                "Update here to change it everywhere at once",
            ],
        },
    ),
    (
        "integrations",
        HelpEntry {
            title: "Integrations Overview",
            body: "Connect external services to extend the CRM.\n\n- Supabase: cloud database for persistent storage. Without it the contact pages show a connection banner.\n- SendGrid: email delivery for campaigns, invoices and notifications.\n- Microsoft 365: calendar, mail, planner and contacts sync through the Graph API.",
            tips: &[
                "Supabase is required for data to persist between sessions",
                "SendGrid requires a verified sender email",
            ],
        },
    ),
    (
        "supabase",
        HelpEntry {
            title: "Supabase (Database)",
            body: "Supabase provides the hosted PostgreSQL database that stores contacts, deals, tasks and invoices.\n\nStatus:\n- Connected: the database is reachable and storing data\n- Not connected: database-backed pages show an error banner\n\nTo connect, set SUPABASE_URL and SUPABASE_ANON_KEY in .env, or run `crm config set-supabase`.",
            tips: &[
                "Find the URL and anon key under Project Settings > API",
                "The anon key is safe to use client-side",
                "Use `crm db test` to verify the connection",
            ],
        },
    ),
    (
        "sendgrid",
        HelpEntry {
            title: "SendGrid (Email)",
            body: "SendGrid handles outbound email delivery: campaigns, invoice emails, follow-up sequences and notifications.\n\nTo connect:\n1. Create an account at sendgrid.com\n2. Settings > API Keys > Create API Key\n3. Grant at least \"Mail Send\"\n4. Paste the key (starts with `SG.`)",
            tips: &[
                "Free tier: 100 emails/day",
                "Verify your sender email in SendGrid first",
                "The API key is shown only once, so save it securely",
            ],
        },
    ),
    (
        "microsoft_365",
        HelpEntry {
            title: "Microsoft 365 Integration",
            body: "Connects the CRM to Microsoft's services through the Graph API.\n\nActive services:\n- Email\n- Calendar\n- Planner\n- To-Do tasks\n- Directory contacts",
            tips: &[
                "Calendar sync is bidirectional",
                "Planner is for business tasks; To-Do is for personal tasks",
            ],
        },
    ),
    (
        "billing",
        HelpEntry {
            title: "Billing & Invoicing",
            body: "Configure how invoices are generated and which defaults they use.\n\nFields:\n- Default Hourly Rate: pre-filled rate for new time entries\n- Tax Rate: applied to invoice subtotals\n- Invoice Prefix: appears before invoice numbers (e.g. INV-2026-001)\n- Payment Due Days: default net terms",
            tips: &[
                "You can override the rate on individual time entries",
                "Invoice numbering is automatic and sequential",
            ],
        },
    ),
    (
        "email_settings",
        HelpEntry {
            title: "Email Settings",
            body: "Configure how outbound emails behave.\n\n- Email Signature: appended to all outgoing emails\n- Track Opens / Track Clicks: recipient engagement tracking\n- BCC Yourself: get a copy of every email sent\n- Daily Summary: daily digest of email activity",
            tips: &[
                "Open tracking uses a tiny invisible pixel",
                "Some email clients block tracking pixels",
            ],
        },
    ),
    (
        "danger_zone",
        HelpEntry {
            title: "Danger Zone",
            body: "Data management tools. Use with caution.\n\n- Export All Data: downloads a JSON backup of all CRM tables\n- Clear Session Data: discards local session state; database rows are untouched",
            tips: &[
                "Export regularly as a backup",
                "Always export before making major changes",
            ],
        },
    ),
    (
        "security",
        HelpEntry {
            title: "Password & Security",
            body: "Manage CRM login credentials.\n\n- Change Password: requires the current password\n- Forgot Password: reset codes go to the configured admin email",
            tips: &[
                "Use a strong, unique password",
                "Admin email is set via the ADMIN_EMAIL environment variable",
            ],
        },
    ),
    (
        "dashboard",
        HelpEntry {
            title: "Dashboard Overview",
            body: "Key metrics, recent activity and quick actions at a glance.\n\nMetrics show counts of contacts, active deals, pipeline value and tasks.",
            tips: &["The dashboard reloads from the database on each visit"],
        },
    ),
    (
        "contacts",
        HelpEntry {
            title: "Contacts",
            body: "Your central contact database: clients, leads, vendors and partners.\n\nFeatures:\n- Add and edit contacts with full details\n- Filter by type or tag, search by name, company or email\n- Archive contacts you no longer work with\n- Business card photos shown on the detail page",
            tips: &[
                "Tags help organize contacts into groups",
                "Archived contacts are hidden from the list but not deleted",
            ],
        },
    ),
    (
        "contact_type",
        HelpEntry {
            title: "Contact Type",
            body: "Where the contact sits in your relationship lifecycle: Networking, Prospect, Lead, Client, Former Client, Partner or Vendor.",
            tips: &["Changing the type updates the stats row on the list page"],
        },
    ),
    (
        "pipeline",
        HelpEntry {
            title: "Sales Pipeline",
            body: "Deal tracking from lead to close.\n\nStages: Lead > Qualified > Proposal > Negotiation > Closed Won / Lost",
            tips: &[
                "Keep deal values updated for accurate forecasting",
                "Mark lost deals with a reason to track patterns",
            ],
        },
    ),
];

/// Static topic lookup, built once per process.
#[derive(Debug, Clone)]
pub struct HelpRegistry {
    topics: BTreeMap<&'static str, &'static HelpEntry>,
}

impl Default for HelpRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl HelpRegistry {
    pub fn builtin() -> Self {
        Self {
            topics: TOPICS.iter().map(|(key, entry)| (*key, entry)).collect(),
        }
    }

    /// Never fails: unknown keys resolve to [`NO_HELP`].
    pub fn lookup(&self, key: &str) -> &'static HelpEntry {
        self.topics.get(key.trim()).copied().unwrap_or(&NO_HELP)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.topics.contains_key(key.trim())
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.topics.keys().copied()
    }

    /// Text form of the help popover for `key`.
    pub fn render_popover(&self, key: &str) -> String {
        let entry = self.lookup(key);
        let mut out = format!("**{}**\n\n{}\n", entry.title, entry.body);
        if !entry.tips.is_empty() {
            out.push_str("\n---\nTips:\n");
            for tip in entry.tips {
                out.push_str(&format!("- {tip}\n"));
            }
        }
        out
    }

    /// Section header with a `[?]` marker when a topic exists.
    pub fn help_header(&self, title: &str, key: &str, level: usize) -> String {
        let hashes = "#".repeat(level.clamp(1, 6));
        if self.contains(key) {
            format!("{hashes} {title} [?{key}]")
        } else {
            format!("{hashes} {title}")
        }
    }
}
