use serde::Serialize;

/// Theme-to-template mapping. Each product theme carries an ordered primary
/// pool plus a pairing to a second theme whose pool supplies the paywalled
/// bonus set. Template references mix schemes on purpose: remote URLs and
/// object-store paths both occur in production records.
#[derive(Clone, Copy)]
pub struct ThemeDefinition {
    pub label: &'static str,
    pub caption_required: bool,
    pub bonus_pairing: &'static str,
    pub templates: &'static [TemplateDefinition],
}

#[derive(Clone, Copy)]
pub struct TemplateDefinition {
    pub id: &'static str,
    pub reference: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateRef {
    pub id: String,
    pub reference: String,
    pub theme_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThemePlan {
    pub theme_name: String,
    pub caption_required: bool,
    pub primary: Vec<TemplateRef>,
    pub bonus: Vec<TemplateRef>,
}

const THEME_POOL: [ThemeDefinition; 4] = [
    ThemeDefinition {
        label: "royal",
        caption_required: true,
        bonus_pairing: "renaissance",
        templates: &[
            TemplateDefinition { id: "royal-01", reference: "templates/royal/throne.png" },
            TemplateDefinition { id: "royal-02", reference: "templates/royal/crown.png" },
            TemplateDefinition { id: "royal-03", reference: "templates/royal/cape.png" },
            TemplateDefinition { id: "royal-04", reference: "templates/royal/banquet.png" },
            TemplateDefinition { id: "royal-05", reference: "templates/royal/garden.png" },
        ],
    },
    ThemeDefinition {
        label: "renaissance",
        caption_required: false,
        bonus_pairing: "royal",
        templates: &[
            TemplateDefinition { id: "ren-01", reference: "templates/renaissance/oil.png" },
            TemplateDefinition { id: "ren-02", reference: "templates/renaissance/noble.png" },
            TemplateDefinition { id: "ren-03", reference: "templates/renaissance/scholar.png" },
            TemplateDefinition { id: "ren-04", reference: "templates/renaissance/duchess.png" },
            TemplateDefinition { id: "ren-05", reference: "templates/renaissance/painter.png" },
        ],
    },
    ThemeDefinition {
        label: "astronaut",
        caption_required: true,
        bonus_pairing: "superhero",
        templates: &[
            TemplateDefinition { id: "astro-01", reference: "templates/astronaut/suit.png" },
            TemplateDefinition { id: "astro-02", reference: "templates/astronaut/moon.png" },
            TemplateDefinition { id: "astro-03", reference: "templates/astronaut/station.png" },
            TemplateDefinition { id: "astro-04", reference: "templates/astronaut/launch.png" },
            TemplateDefinition { id: "astro-05", reference: "templates/astronaut/orbit.png" },
        ],
    },
    ThemeDefinition {
        label: "superhero",
        caption_required: false,
        bonus_pairing: "astronaut",
        templates: &[
            TemplateDefinition { id: "hero-01", reference: "templates/superhero/cape.png" },
            TemplateDefinition { id: "hero-02", reference: "templates/superhero/skyline.png" },
            TemplateDefinition { id: "hero-03", reference: "templates/superhero/mask.png" },
            TemplateDefinition { id: "hero-04", reference: "templates/superhero/flight.png" },
            TemplateDefinition { id: "hero-05", reference: "templates/superhero/rescue.png" },
        ],
    },
];

const DEFAULT_THEME: &str = "royal";

fn theme_by_label(label: &str) -> &'static ThemeDefinition {
    let normalized = label.trim().to_lowercase();
    THEME_POOL
        .iter()
        .find(|theme| normalized.contains(theme.label))
        .or_else(|| THEME_POOL.iter().find(|theme| theme.label == DEFAULT_THEME))
        .unwrap_or(&THEME_POOL[0])
}

fn take_templates(theme: &'static ThemeDefinition, count: usize) -> Vec<TemplateRef> {
    theme
        .templates
        .iter()
        .cycle()
        .take(count)
        .map(|template| TemplateRef {
            id: template.id.to_string(),
            reference: template.reference.to_string(),
            theme_name: theme.label.to_string(),
        })
        .collect()
}

/// Resolve a product/theme label into the ordered primary set and the bonus
/// set drawn from the paired theme. Unknown labels fall back to the default
/// theme rather than failing intake.
pub fn resolve_theme(label: &str, primary_count: usize, bonus_count: usize) -> ThemePlan {
    let theme = theme_by_label(label);
    let bonus_theme = THEME_POOL
        .iter()
        .find(|candidate| candidate.label == theme.bonus_pairing)
        .unwrap_or(theme);

    ThemePlan {
        theme_name: theme.label.to_string(),
        caption_required: theme.caption_required,
        primary: take_templates(theme, primary_count),
        bonus: take_templates(bonus_theme, bonus_count),
    }
}

/// Exact template lookup by id, used by regeneration so repeated attempts
/// reuse the original template instead of drawing a fresh one.
pub fn find_template(template_id: &str) -> Option<TemplateRef> {
    THEME_POOL.iter().find_map(|theme| {
        theme
            .templates
            .iter()
            .find(|template| template.id == template_id)
            .map(|template| TemplateRef {
                id: template.id.to_string(),
                reference: template.reference.to_string(),
                theme_name: theme.label.to_string(),
            })
    })
}
