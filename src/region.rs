//! Named/tagged 2D regions, their point-in-region test, and the
//! tag-or-name lookup grammar used to bind an observer to a set of
//! regions.

use serde::{Deserialize, Serialize};

use crate::Point2D;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Shape {
    Rectangle,
    Ellipse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Edge {
    Top,
    Bottom,
    Left,
    Right,
}

/// A single named area that Trackables are tested against. Lightweight
/// and referenced by id everywhere else rather than owned; the
/// per-region ObservedObjects tables live on the `Observer`s that
/// bind to a region, not on the region itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub tags: Vec<String>,
    pub layers: Vec<String>,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub shape: Shape,
    /// When set, the region degenerates into a half-plane: the test
    /// passes when the point is on the named edge's side, regardless
    /// of extent along the other axis.
    pub edge: Option<Edge>,
    pub invert: bool,
}

impl Region {
    pub fn contains(&self, point: Point2D) -> bool {
        let raw = match self.edge {
            Some(edge) => self.edge_test(edge, point),
            None => match self.shape {
                Shape::Rectangle => self.rectangle_test(point),
                Shape::Ellipse => self.ellipse_test(point),
            },
        };
        raw != self.invert
    }

    fn rectangle_test(&self, (x, y): Point2D) -> bool {
        x >= self.x && x <= self.x + self.w && y >= self.y && y <= self.y + self.h
    }

    fn ellipse_test(&self, (x, y): Point2D) -> bool {
        let cx = self.x + self.w / 2.0;
        let cy = self.y + self.h / 2.0;
        let rx = self.w / 2.0;
        let ry = self.h / 2.0;
        if rx <= 0.0 || ry <= 0.0 {
            return false;
        }
        let nx = (x - cx) / rx;
        let ny = (y - cy) / ry;
        nx * nx + ny * ny <= 1.0
    }

    fn edge_test(&self, edge: Edge, (x, y): Point2D) -> bool {
        match edge {
            Edge::Top => y <= self.y,
            Edge::Bottom => y >= self.y + self.h,
            Edge::Left => x <= self.x,
            Edge::Right => x >= self.x + self.w,
        }
    }
}

/// Holds every configured region, resolving the `regions = [...]`
/// binding grammar for observers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionModel {
    pub regions: Vec<Region>,
}

impl RegionModel {
    pub fn new(regions: Vec<Region>) -> Self {
        RegionModel { regions }
    }

    pub fn by_name(&self, name: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.name == name)
    }

    /// Resolve a comma-separated tag-or-name token list into the set
    /// of matched region names. `all` matches every region; a leading
    /// `~` on a token inverts that single token's contribution,
    /// removing matches from the accumulated set rather than adding
    /// to it.
    pub fn resolve(&self, token_list: &str) -> Vec<String> {
        let mut matched: Vec<String> = Vec::new();
        for raw_token in token_list.split(',') {
            let token = raw_token.trim();
            if token.is_empty() {
                continue;
            }
            let (invert, token) = match token.strip_prefix('~') {
                Some(rest) => (true, rest),
                None => (false, token),
            };

            let names: Vec<String> = if token == "all" {
                self.regions.iter().map(|r| r.name.clone()).collect()
            } else {
                self.regions
                    .iter()
                    .filter(|r| r.name == token || r.tags.iter().any(|t| t == token))
                    .map(|r| r.name.clone())
                    .collect()
            };

            if invert {
                matched.retain(|m| !names.contains(m));
            } else {
                for n in names {
                    if !matched.contains(&n) {
                        matched.push(n);
                    }
                }
            }
        }
        matched
    }
}

/// Parsed form of `regions = [tag_or_name_list] [= unite_rule]`: the
/// resolved region names plus an optional key under which their
/// ObservedObjects tables merge into one virtual region.
#[derive(Debug, Clone)]
pub struct RegionBinding {
    pub token_list: String,
    pub unite_rule: Option<String>,
}

impl RegionBinding {
    /// Parses `"lobby,~vip = zoneA"` into token list + unite rule.
    pub fn parse(input: &str) -> RegionBinding {
        match input.split_once('=') {
            Some((tokens, rule)) => RegionBinding {
                token_list: tokens.trim().to_string(),
                unite_rule: Some(rule.trim().to_string()),
            },
            None => RegionBinding {
                token_list: input.trim().to_string(),
                unite_rule: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(name: &str, tags: &[&str], x: f32, y: f32, w: f32, h: f32) -> Region {
        Region {
            name: name.to_string(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            layers: Vec::new(),
            x,
            y,
            w,
            h,
            shape: Shape::Rectangle,
            edge: None,
            invert: false,
        }
    }

    #[test]
    fn rectangle_contains_interior_point() {
        let r = rect("a", &[], 0.0, 0.0, 2.0, 2.0);
        assert!(r.contains((1.0, 1.0)));
        assert!(!r.contains((3.0, 1.0)));
    }

    #[test]
    fn ellipse_excludes_corner_of_bounding_box() {
        let mut r = rect("a", &[], 0.0, 0.0, 2.0, 2.0);
        r.shape = Shape::Ellipse;
        assert!(r.contains((1.0, 1.0)));
        assert!(!r.contains((0.01, 0.01)));
    }

    #[test]
    fn invert_flag_negates_the_test() {
        let mut r = rect("a", &[], 0.0, 0.0, 2.0, 2.0);
        r.invert = true;
        assert!(!r.contains((1.0, 1.0)));
        assert!(r.contains((5.0, 5.0)));
    }

    #[test]
    fn edge_qualifier_ignores_the_orthogonal_extent() {
        let mut r = rect("a", &[], 0.0, 0.0, 2.0, 2.0);
        r.edge = Some(Edge::Top);
        // Far outside x-extent, but still north of y=0.
        assert!(r.contains((500.0, -1.0)));
        assert!(!r.contains((500.0, 1.0)));
    }

    #[test]
    fn all_token_matches_every_region() {
        let model = RegionModel::new(vec![rect("a", &[], 0.0, 0.0, 1.0, 1.0), rect("b", &[], 0.0, 0.0, 1.0, 1.0)]);
        let mut names = model.resolve("all");
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn tilde_prefix_removes_a_region_from_the_accumulated_set() {
        let model = RegionModel::new(vec![rect("a", &["vip"], 0.0, 0.0, 1.0, 1.0), rect("b", &[], 0.0, 0.0, 1.0, 1.0)]);
        let names = model.resolve("all,~vip");
        assert_eq!(names, vec!["b".to_string()]);
    }

    #[test]
    fn binding_parses_optional_unite_rule() {
        let binding = RegionBinding::parse("lobby,~vip = zoneA");
        assert_eq!(binding.token_list, "lobby,~vip");
        assert_eq!(binding.unite_rule, Some("zoneA".to_string()));

        let binding = RegionBinding::parse("lobby");
        assert_eq!(binding.unite_rule, None);
    }
}
