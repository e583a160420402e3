//! Theme Catalog - Static Definitions of Purchasable Color Themes
//!
//! Every theme the app can ever display is defined here at startup. Themes
//! are immutable; ownership of them is tracked separately by the
//! [`EntitlementManager`](crate::manager::EntitlementManager).
//!
//! Premium themes map 1:1 to platform store products. The product id is the
//! catalog's product prefix joined with the theme id (e.g.
//! `com.dailymood.theme.dark`), and the catalog keeps a reverse lookup so
//! transaction callbacks can resolve a product back to its theme.

use std::collections::HashMap;

/// Theme id every install owns unconditionally.
pub const DEFAULT_THEME_ID: &str = "default";

// ============================================================================
// Colors
// ============================================================================

/// An sRGB color with alpha.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    /// Fully opaque color from RGB components.
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Parse a hex color string.
    ///
    /// Accepts 3-digit RGB (`#abc`), 6-digit RGB (`#aabbcc`) and 8-digit
    /// ARGB (`#ffaabbcc`) forms, with or without the leading `#`.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim_start_matches('#');
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let value = u32::from_str_radix(hex, 16).ok()?;
        match hex.len() {
            3 => {
                // 4-bit channels, replicated to 8 bits
                let r = ((value >> 8) & 0xF) as u8 * 17;
                let g = ((value >> 4) & 0xF) as u8 * 17;
                let b = (value & 0xF) as u8 * 17;
                Some(Self::rgb(r, g, b))
            }
            6 => Some(Self::rgb(
                (value >> 16) as u8,
                (value >> 8) as u8,
                value as u8,
            )),
            8 => Some(Self::rgba(
                (value >> 16) as u8,
                (value >> 8) as u8,
                value as u8,
                (value >> 24) as u8,
            )),
            _ => None,
        }
    }
}

/// The named color slots a theme fills in.
///
/// Slots mirror the surfaces the app actually paints: content, chrome, and
/// the two bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    /// Main color for buttons and interactive elements.
    pub primary: Color,
    /// App background.
    pub background: Color,
    /// Card/content background.
    pub card: Color,
    /// Primary text color.
    pub text: Color,
    /// Accent/highlight color.
    pub accent: Color,
    /// Shadow color for depth effects.
    pub shadow: Color,
    pub nav_bar_background: Color,
    pub nav_bar_text: Color,
    pub tab_bar_background: Color,
    pub tab_bar_selected: Color,
    pub tab_bar_unselected: Color,
}

const GRAY: Color = Color::rgb(0x8e, 0x8e, 0x93);
const PURPLE: Color = Color::rgb(0xaf, 0x52, 0xde);

impl Palette {
    /// Light palette of the free default theme.
    pub const fn default_light() -> Self {
        Self {
            primary: PURPLE,
            background: Color::rgb(0xff, 0xff, 0xff),
            card: Color::rgb(0xf2, 0xf2, 0xf7),
            text: Color::rgb(0x00, 0x00, 0x00),
            accent: PURPLE,
            shadow: Color::rgba(0x00, 0x00, 0x00, 0x33),
            nav_bar_background: Color::rgb(0xff, 0xff, 0xff),
            nav_bar_text: Color::rgb(0x00, 0x00, 0x00),
            tab_bar_background: Color::rgb(0xff, 0xff, 0xff),
            tab_bar_selected: PURPLE,
            tab_bar_unselected: GRAY,
        }
    }

    pub const fn dark() -> Self {
        Self {
            primary: PURPLE,
            background: Color::rgb(0x1a, 0x1a, 0x1a),
            card: Color::rgb(0x33, 0x33, 0x33),
            text: Color::rgb(0xff, 0xff, 0xff),
            accent: PURPLE,
            shadow: Color::rgba(0xff, 0xff, 0xff, 0x1a),
            nav_bar_background: Color::rgb(0x26, 0x26, 0x26),
            nav_bar_text: Color::rgb(0xff, 0xff, 0xff),
            tab_bar_background: Color::rgb(0x26, 0x26, 0x26),
            tab_bar_selected: PURPLE,
            tab_bar_unselected: GRAY,
        }
    }

    pub const fn galaxy() -> Self {
        Self {
            primary: Color::rgb(0x26, 0x68, 0xc2),
            background: Color::rgb(0x31, 0x34, 0x88),
            card: Color::rgba(0x41, 0x9b, 0xc9, 0xb3),
            text: Color::rgb(0xff, 0xff, 0xff),
            accent: Color::rgb(0x76, 0xff, 0xd6),
            shadow: Color::rgba(0x00, 0x00, 0x00, 0x80),
            nav_bar_background: Color::rgb(0x26, 0x68, 0xc2),
            nav_bar_text: Color::rgb(0xff, 0xff, 0xff),
            tab_bar_background: Color::rgb(0x26, 0x68, 0xc2),
            tab_bar_selected: Color::rgb(0x76, 0xff, 0xd6),
            tab_bar_unselected: Color::rgba(0x5c, 0xcd, 0xd0, 0x99),
        }
    }

    pub const fn tides() -> Self {
        Self {
            primary: Color::rgb(0x0a, 0x6e, 0xbd),
            background: Color::rgb(0xe3, 0xf2, 0xfd),
            card: Color::rgb(0xbb, 0xde, 0xfb),
            text: Color::rgb(0x0d, 0x47, 0xa1),
            accent: Color::rgb(0x00, 0xac, 0xc1),
            shadow: Color::rgba(0x0d, 0x47, 0xa1, 0x33),
            nav_bar_background: Color::rgb(0x0a, 0x6e, 0xbd),
            nav_bar_text: Color::rgb(0xff, 0xff, 0xff),
            tab_bar_background: Color::rgb(0x0a, 0x6e, 0xbd),
            tab_bar_selected: Color::rgb(0x00, 0xac, 0xc1),
            tab_bar_unselected: Color::rgb(0x90, 0xca, 0xf9),
        }
    }

    pub const fn forest() -> Self {
        Self {
            primary: Color::rgb(0x2e, 0x7d, 0x32),
            background: Color::rgb(0xe8, 0xf5, 0xe9),
            card: Color::rgb(0xc8, 0xe6, 0xc9),
            text: Color::rgb(0x1b, 0x5e, 0x20),
            accent: Color::rgb(0x66, 0xbb, 0x6a),
            shadow: Color::rgba(0x1b, 0x5e, 0x20, 0x33),
            nav_bar_background: Color::rgb(0x2e, 0x7d, 0x32),
            nav_bar_text: Color::rgb(0xff, 0xff, 0xff),
            tab_bar_background: Color::rgb(0x2e, 0x7d, 0x32),
            tab_bar_selected: Color::rgb(0xa5, 0xd6, 0xa7),
            tab_bar_unselected: Color::rgb(0x81, 0xc7, 0x84),
        }
    }

    pub const fn sunset() -> Self {
        Self {
            primary: Color::rgb(0xef, 0x6c, 0x00),
            background: Color::rgb(0xff, 0xf3, 0xe0),
            card: Color::rgb(0xff, 0xe0, 0xb2),
            text: Color::rgb(0xe6, 0x51, 0x00),
            accent: Color::rgb(0xff, 0x70, 0x43),
            shadow: Color::rgba(0xe6, 0x51, 0x00, 0x33),
            nav_bar_background: Color::rgb(0xef, 0x6c, 0x00),
            nav_bar_text: Color::rgb(0xff, 0xff, 0xff),
            tab_bar_background: Color::rgb(0xef, 0x6c, 0x00),
            tab_bar_selected: Color::rgb(0xff, 0xcc, 0x80),
            tab_bar_unselected: Color::rgb(0xff, 0xab, 0x66),
        }
    }
}

// ============================================================================
// Themes
// ============================================================================

/// A named, priced, ownership-gated palette of display colors.
#[derive(Debug, Clone, PartialEq)]
pub struct Theme {
    /// Stable identifier, also the last segment of the store product id.
    pub id: String,
    /// Display name shown in the theme store.
    pub name: String,
    /// Whether the theme must be purchased before activation.
    pub premium: bool,
    /// Display price string ("Free", "$0.99", ...).
    pub price: String,
    pub palette: Palette,
}

impl Theme {
    fn new(id: &str, name: &str, premium: bool, price: &str, palette: Palette) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            premium,
            price: price.to_string(),
            palette,
        }
    }
}

/// Immutable catalog of all known themes plus the product id mappings.
#[derive(Debug, Clone)]
pub struct ThemeCatalog {
    themes: Vec<Theme>,
    theme_to_product: HashMap<String, String>,
    product_to_theme: HashMap<String, String>,
}

impl ThemeCatalog {
    /// Build a catalog from a list of themes.
    ///
    /// `product_prefix` is the reverse-DNS prefix of the app's in-app
    /// purchase products; premium theme ids are appended to it.
    pub fn new(themes: Vec<Theme>, product_prefix: &str) -> Self {
        let mut theme_to_product = HashMap::new();
        let mut product_to_theme = HashMap::new();
        for theme in themes.iter().filter(|t| t.premium) {
            let product_id = format!("{}.{}", product_prefix.trim_end_matches('.'), theme.id);
            theme_to_product.insert(theme.id.clone(), product_id.clone());
            product_to_theme.insert(product_id, theme.id.clone());
        }
        Self {
            themes,
            theme_to_product,
            product_to_theme,
        }
    }

    /// The catalog shipped with the app.
    pub fn built_in(product_prefix: &str) -> Self {
        Self::new(
            vec![
                Theme::new("default", "Default", false, "Free", Palette::default_light()),
                Theme::new("dark", "Dark Mode", true, "$0.99", Palette::dark()),
                Theme::new("galaxy", "Galaxy", true, "$2.99", Palette::galaxy()),
                Theme::new("tides", "Tides", true, "$2.99", Palette::tides()),
                Theme::new("forest", "Forest Green", true, "$2.99", Palette::forest()),
                Theme::new("sunset", "Sunset Orange", true, "$2.99", Palette::sunset()),
            ],
            product_prefix,
        )
    }

    pub fn themes(&self) -> &[Theme] {
        &self.themes
    }

    pub fn get(&self, theme_id: &str) -> Option<&Theme> {
        self.themes.iter().find(|t| t.id == theme_id)
    }

    pub fn contains(&self, theme_id: &str) -> bool {
        self.get(theme_id).is_some()
    }

    /// Store product id for a premium theme.
    pub fn product_for_theme(&self, theme_id: &str) -> Option<&str> {
        self.theme_to_product.get(theme_id).map(String::as_str)
    }

    /// Reverse lookup from a store product id to its theme.
    pub fn theme_for_product(&self, product_id: &str) -> Option<&str> {
        self.product_to_theme.get(product_id).map(String::as_str)
    }

    /// Product ids of every premium theme, for the store catalog fetch.
    pub fn premium_product_ids(&self) -> Vec<String> {
        self.themes
            .iter()
            .filter_map(|t| self.theme_to_product.get(&t.id).cloned())
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
