//! Metadata document parsing.
//!
//! Documents are read into a small element tree with quick-xml, the dialect
//! is detected from the root element, and each dialect pulls descriptive
//! fields from its own element names. Namespace prefixes are ignored when
//! matching; only the local name is compared.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use crate::record::{DescriptiveMetadata, MetadataStandard};

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("XML error: {0}")]
    Xml(String),

    #[error("document has no root element")]
    Empty,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct XmlElement {
    pub qualified: String,
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    fn from_start(start: &BytesStart<'_>) -> Self {
        let qualified = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let attributes = start
            .attributes()
            .flatten()
            .map(|a| {
                let key = String::from_utf8_lossy(a.key.local_name().as_ref()).into_owned();
                let value = a
                    .unescape_value()
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&a.value).into_owned());
                (key, value)
            })
            .collect();
        Self {
            qualified,
            name,
            attributes,
            text: String::new(),
            children: Vec::new(),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First descendant (depth-first, self excluded) with the given name.
    pub fn find(&self, name: &str) -> Option<&XmlElement> {
        for child in &self.children {
            if child.is(name) {
                return Some(child);
            }
            if let Some(found) = child.find(name) {
                return Some(found);
            }
        }
        None
    }

    /// First descendant matching any of the names, tried in order.
    pub fn find_any(&self, names: &[&str]) -> Option<&XmlElement> {
        names.iter().find_map(|n| self.find(n))
    }

    pub fn find_all<'a>(&'a self, name: &str, out: &mut Vec<&'a XmlElement>) {
        for child in &self.children {
            if child.is(name) {
                out.push(child);
            }
            child.find_all(name, out);
        }
    }

    pub fn all(&self, name: &str) -> Vec<&XmlElement> {
        let mut out = Vec::new();
        self.find_all(name, &mut out);
        out
    }

    /// Trimmed text of this element, or of its descendants when it only
    /// wraps other elements (ISO `gco:CharacterString`). `None` if blank.
    pub fn value(&self) -> Option<String> {
        let own = self.text.trim();
        if !own.is_empty() {
            return Some(collapse_ws(own));
        }
        let mut parts = Vec::new();
        self.collect_text(&mut parts);
        let joined = parts.join(" ");
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }

    fn collect_text(&self, parts: &mut Vec<String>) {
        for child in &self.children {
            let text = child.text.trim();
            if !text.is_empty() {
                parts.push(collapse_ws(text));
            }
            child.collect_text(parts);
        }
    }

    fn values_of(&self, name: &str) -> Vec<String> {
        self.all(name).into_iter().filter_map(XmlElement::value).collect()
    }

    fn value_of(&self, names: &[&str]) -> Option<String> {
        names
            .iter()
            .flat_map(|n| self.all(n))
            .find_map(XmlElement::value)
    }
}

fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn resolve_entity(name: &str) -> Option<String> {
    let resolved = match name {
        "amp" => "&",
        "lt" => "<",
        "gt" => ">",
        "quot" => "\"",
        "apos" => "'",
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()
            } else {
                name.strip_prefix('#').and_then(|d| d.parse().ok())
            };
            return code.and_then(char::from_u32).map(String::from);
        }
    };
    Some(resolved.to_string())
}

pub(crate) fn parse_tree(xml: &str) -> Result<XmlElement, DocumentError> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) {
        match stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None => {
                if root.is_none() {
                    *root = Some(element);
                }
            }
        }
    }

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => stack.push(XmlElement::from_start(e)),
            Ok(Event::Empty(ref e)) => {
                let element = XmlElement::from_start(e);
                attach(&mut stack, &mut root, element);
            }
            Ok(Event::End(_)) => {
                if let Some(element) = stack.pop() {
                    attach(&mut stack, &mut root, element);
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(top) = stack.last_mut() {
                    let decoded = e.decode().unwrap_or_default();
                    top.text.push_str(&decoded);
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if let Some(top) = stack.last_mut() {
                    let name = String::from_utf8_lossy(&e);
                    if let Some(resolved) = resolve_entity(&name) {
                        top.text.push_str(&resolved);
                    }
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Ok(Event::Eof) => {
                if let Some(open) = stack.last() {
                    return Err(DocumentError::Xml(format!("unclosed element <{}>", open.qualified)));
                }
                break;
            }
            Err(e) => return Err(DocumentError::Xml(e.to_string())),
            _ => {}
        }
    }

    root.ok_or(DocumentError::Empty)
}

/// Detects the dialect of a parsed document from its root element.
pub(crate) fn detect_standard(root: &XmlElement) -> MetadataStandard {
    if root.is("qgis") {
        return MetadataStandard::Qgis;
    }
    if root.is("MD_Metadata") || root.is("MI_Metadata") {
        let prefix_3 = root.qualified.starts_with("mdb:") || root.qualified.starts_with("mdi:");
        let ns_3 = root
            .attributes
            .iter()
            .any(|(k, v)| k == "mdb" || v.contains("19115/-3"));
        return if prefix_3 || ns_3 {
            MetadataStandard::Iso19115_3
        } else {
            MetadataStandard::Iso19115
        };
    }
    if root.name.to_ascii_lowercase().contains("metadata") {
        if root.name.to_ascii_lowercase().contains("fgdc") || root.children.iter().any(|c| c.is("idinfo")) {
            return MetadataStandard::Fgdc;
        }
        if root
            .children
            .iter()
            .any(|c| c.name.contains("Esri") || c.is("dataIdInfo"))
        {
            return MetadataStandard::Esri;
        }
    }
    MetadataStandard::Unknown
}

/// Parses a metadata document into descriptive fields.
pub fn parse_document(xml: &str, document_path: &str) -> Result<DescriptiveMetadata, DocumentError> {
    let root = parse_tree(xml)?;
    let standard = detect_standard(&root);
    let mut meta = DescriptiveMetadata::empty(standard, document_path);

    match standard {
        MetadataStandard::Fgdc => fill_fgdc(&root, &mut meta),
        MetadataStandard::Esri => {
            fill_esri(&root, &mut meta);
            // ArcGIS documents often embed an FGDC section too.
            if meta.title.is_none() || meta.abstract_text.is_none() {
                let mut fgdc = DescriptiveMetadata::empty(standard, document_path);
                fill_fgdc(&root, &mut fgdc);
                merge_missing(&mut meta, fgdc);
            }
        }
        MetadataStandard::Iso19115 | MetadataStandard::Iso19115_3 => fill_iso(&root, &mut meta),
        MetadataStandard::Qgis => fill_qgis(&root, &mut meta),
        MetadataStandard::Unknown => {
            meta.title = root.value_of(&["title"]);
            meta.abstract_text = root.value_of(&["abstract", "description"]);
        }
    }

    meta.keywords = dedupe(std::mem::take(&mut meta.keywords));
    meta.links = dedupe(
        std::mem::take(&mut meta.links)
            .into_iter()
            .filter(|l| is_link(l))
            .collect(),
    );
    meta.topic_categories = dedupe(std::mem::take(&mut meta.topic_categories));
    Ok(meta)
}

fn fill_fgdc(root: &XmlElement, meta: &mut DescriptiveMetadata) {
    meta.title = root.value_of(&["title"]);
    meta.abstract_text = root.value_of(&["abstract"]);
    meta.keywords = root.values_of("themekey");
    meta.keywords.extend(root.values_of("placekey"));
    meta.lineage = root.find("lineage").and_then(|lineage| {
        let own = lineage.text.trim();
        if !own.is_empty() {
            return Some(collapse_ws(own));
        }
        let steps = lineage.values_of("procdesc");
        if steps.is_empty() {
            lineage.value()
        } else {
            Some(steps.join("; "))
        }
    });
    meta.constraints = root.value_of(&["useconst", "accconst"]);
    meta.contact = root.find_any(&["ptcontac", "cntinfo"]).and_then(|c| {
        format_contact(
            c.value_of(&["cntper"]),
            c.value_of(&["cntorg"]),
            c.value_of(&["cntemail"]),
            c.value_of(&["cntvoice"]),
        )
    });
    meta.links = root.values_of("onlink");
    meta.links.extend(root.values_of("networkr"));
}

fn fill_esri(root: &XmlElement, meta: &mut DescriptiveMetadata) {
    meta.title = root.value_of(&["resTitle", "title"]);
    meta.abstract_text = root.value_of(&["idAbs", "abstract"]);
    meta.keywords = root.values_of("keyword");
    meta.keywords.extend(root.values_of("themekey"));
    meta.lineage = root
        .find("dataLineage")
        .and_then(|l| l.value_of(&["statement"]))
        .or_else(|| root.value_of(&["statement"]));
    meta.constraints = root.value_of(&["useLimit", "useconst"]);
    meta.contact = root.find_any(&["rpCntInfo", "ptcontac"]).and_then(|c| {
        format_contact(
            c.value_of(&["rpIndName", "cntper"]),
            c.value_of(&["rpOrgName", "cntorg"]),
            c.value_of(&["eMailAdd", "cntemail"]),
            c.value_of(&["voiceNum", "cntvoice"]),
        )
    });
    meta.links = root.values_of("linkage");
    meta.links.extend(root.values_of("onlink"));
    meta.topic_categories = root
        .all("TopicCatCd")
        .into_iter()
        .filter_map(|c| c.attr("value").map(str::to_string))
        .collect();
}

fn fill_iso(root: &XmlElement, meta: &mut DescriptiveMetadata) {
    let ident = root.find("identificationInfo").unwrap_or(root);
    meta.title = ident
        .find("citation")
        .and_then(|c| c.value_of(&["title"]))
        .or_else(|| root.value_of(&["title"]));
    meta.abstract_text = ident.value_of(&["abstract"]);
    meta.keywords = ident.values_of("keyword");
    meta.lineage = root
        .find_any(&["LI_Lineage", "resourceLineage", "lineage"])
        .and_then(|l| l.value_of(&["statement"]));
    let limitations = root.values_of("useLimitation");
    meta.constraints = if limitations.is_empty() {
        root.value_of(&["otherConstraints"])
    } else {
        Some(limitations.join("; "))
    };
    meta.contact = ident
        .find("pointOfContact")
        .or_else(|| root.find("contact"))
        .and_then(|c| {
            let organisation = c
                .find("CI_Organisation")
                .and_then(|o| o.children.iter().find(|x| x.is("name")).and_then(XmlElement::value))
                .or_else(|| c.value_of(&["organisationName"]));
            let person = c
                .find("CI_Individual")
                .and_then(|i| i.children.iter().find(|x| x.is("name")).and_then(XmlElement::value))
                .or_else(|| c.value_of(&["individualName"]));
            format_contact(
                person,
                organisation,
                c.value_of(&["electronicMailAddress"]),
                c.find("voice")
                    .and_then(XmlElement::value)
                    .or_else(|| c.find("CI_Telephone").and_then(|t| t.value_of(&["number"]))),
            )
        });
    meta.links = root.values_of("URL");
    meta.links.extend(root.values_of("linkage"));
    meta.topic_categories = root.values_of("MD_TopicCategoryCode");
}

fn fill_qgis(root: &XmlElement, meta: &mut DescriptiveMetadata) {
    meta.title = root.children.iter().find(|c| c.is("title")).and_then(XmlElement::value);
    meta.abstract_text = root.children.iter().find(|c| c.is("abstract")).and_then(XmlElement::value);

    for keywords in root.all("keywords") {
        let topic = keywords
            .attr("vocabulary")
            .map(|v| v.to_ascii_lowercase().contains("topiccategory"))
            .unwrap_or(false);
        let values = keywords.values_of("keyword");
        if topic {
            meta.topic_categories.extend(values);
        } else {
            meta.keywords.extend(values);
        }
    }

    let history = root.values_of("history");
    if !history.is_empty() {
        meta.lineage = Some(history.join("; "));
    }

    let mut constraints = root.values_of("constraints");
    constraints.extend(root.values_of("rights"));
    constraints.extend(root.values_of("license"));
    if !constraints.is_empty() {
        meta.constraints = Some(constraints.join("; "));
    }

    meta.contact = root.find("contact").and_then(|c| {
        format_contact(
            c.value_of(&["name"]),
            c.value_of(&["organization"]),
            c.value_of(&["email"]),
            c.value_of(&["voice"]),
        )
    });

    meta.links = root
        .all("link")
        .into_iter()
        .filter_map(|l| l.attr("url").map(str::to_string).or_else(|| l.value()))
        .collect();
}

fn format_contact(
    name: Option<String>,
    organization: Option<String>,
    email: Option<String>,
    phone: Option<String>,
) -> Option<String> {
    let mut parts = Vec::new();
    parts.extend(name);
    parts.extend(organization);
    if let Some(email) = email {
        parts.push(format!("Email: {}", email));
    }
    if let Some(phone) = phone {
        parts.push(format!("Phone: {}", phone));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" | "))
    }
}

fn merge_missing(meta: &mut DescriptiveMetadata, other: DescriptiveMetadata) {
    if meta.title.is_none() {
        meta.title = other.title;
    }
    if meta.abstract_text.is_none() {
        meta.abstract_text = other.abstract_text;
    }
    if meta.lineage.is_none() {
        meta.lineage = other.lineage;
    }
    if meta.constraints.is_none() {
        meta.constraints = other.constraints;
    }
    if meta.contact.is_none() {
        meta.contact = other.contact;
    }
    meta.keywords.extend(other.keywords);
    meta.links.extend(other.links);
}

fn is_link(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("ftp://")
}

fn dedupe(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .filter(|v| !v.is_empty() && seen.insert(v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FGDC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata>
  <idinfo>
    <citation><citeinfo><title>County Roads</title><onlink>https://gis.example.org/roads</onlink></citeinfo></citation>
    <descript><abstract>Road centerlines &amp; ramps.</abstract></descript>
    <keywords>
      <theme><themekey>transportation</themekey><themekey>roads</themekey></theme>
      <place><placekey>Travis County</placekey></place>
    </keywords>
    <useconst>None</useconst>
    <ptcontac><cntinfo><cntperp><cntper>Jane Doe</cntper><cntorg>GIS Office</cntorg></cntperp><cntvoice>555-0100</cntvoice><cntemail>jane@example.org</cntemail></cntinfo></ptcontac>
  </idinfo>
  <dataqual><lineage><procstep><procdesc>Digitized</procdesc></procstep><procstep><procdesc>Checked</procdesc></procstep></lineage></dataqual>
</metadata>"#;

    #[test]
    fn test_fgdc_document() {
        let meta = parse_document(FGDC, "/data/roads.shp.xml").unwrap();
        assert_eq!(meta.standard, MetadataStandard::Fgdc);
        assert_eq!(meta.title.as_deref(), Some("County Roads"));
        assert_eq!(meta.abstract_text.as_deref(), Some("Road centerlines & ramps."));
        assert_eq!(meta.keywords, vec!["transportation", "roads", "Travis County"]);
        assert_eq!(meta.lineage.as_deref(), Some("Digitized; Checked"));
        assert_eq!(meta.constraints.as_deref(), Some("None"));
        assert_eq!(
            meta.contact.as_deref(),
            Some("Jane Doe | GIS Office | Email: jane@example.org | Phone: 555-0100")
        );
        assert_eq!(meta.links, vec!["https://gis.example.org/roads"]);
    }

    #[test]
    fn test_esri_document() {
        let xml = r#"<metadata xml:lang="en"><Esri><CreaDate>20240101</CreaDate></Esri>
<dataIdInfo><idCitation><resTitle>Parcels</resTitle></idCitation><idAbs>Tax parcels.</idAbs>
<searchKeys><keyword>cadastre</keyword><keyword>parcels</keyword></searchKeys>
<resConst><Consts><useLimit>Internal use</useLimit></Consts></resConst>
<tpCat><TopicCatCd value="010"/></tpCat></dataIdInfo>
<dqInfo><dataLineage><statement>Compiled from deeds</statement></dataLineage></dqInfo></metadata>"#;
        let meta = parse_document(xml, "parcels.xml").unwrap();
        assert_eq!(meta.standard, MetadataStandard::Esri);
        assert_eq!(meta.title.as_deref(), Some("Parcels"));
        assert_eq!(meta.abstract_text.as_deref(), Some("Tax parcels."));
        assert_eq!(meta.keywords, vec!["cadastre", "parcels"]);
        assert_eq!(meta.lineage.as_deref(), Some("Compiled from deeds"));
        assert_eq!(meta.constraints.as_deref(), Some("Internal use"));
        assert_eq!(meta.topic_categories, vec!["010"]);
    }

    #[test]
    fn test_iso_document() {
        let xml = r#"<gmd:MD_Metadata xmlns:gmd="http://www.isotc211.org/2005/gmd" xmlns:gco="http://www.isotc211.org/2005/gco">
<gmd:identificationInfo><gmd:MD_DataIdentification>
<gmd:citation><gmd:CI_Citation><gmd:title><gco:CharacterString>Land Cover 2020</gco:CharacterString></gmd:title></gmd:CI_Citation></gmd:citation>
<gmd:abstract><gco:CharacterString>Classified imagery.</gco:CharacterString></gmd:abstract>
<gmd:pointOfContact><gmd:CI_ResponsibleParty><gmd:organisationName><gco:CharacterString>Mapping Agency</gco:CharacterString></gmd:organisationName>
<gmd:contactInfo><gmd:CI_Contact><gmd:address><gmd:CI_Address><gmd:electronicMailAddress><gco:CharacterString>info@agency.example</gco:CharacterString></gmd:electronicMailAddress></gmd:CI_Address></gmd:address></gmd:CI_Contact></gmd:contactInfo>
</gmd:CI_ResponsibleParty></gmd:pointOfContact>
<gmd:descriptiveKeywords><gmd:MD_Keywords><gmd:keyword><gco:CharacterString>land cover</gco:CharacterString></gmd:keyword></gmd:MD_Keywords></gmd:descriptiveKeywords>
<gmd:topicCategory><gmd:MD_TopicCategoryCode>environment</gmd:MD_TopicCategoryCode></gmd:topicCategory>
</gmd:MD_DataIdentification></gmd:identificationInfo>
<gmd:distributionInfo><gmd:MD_Distribution><gmd:transferOptions><gmd:MD_DigitalTransferOptions><gmd:onLine><gmd:CI_OnlineResource><gmd:linkage><gmd:URL>https://agency.example/landcover</gmd:URL></gmd:linkage></gmd:CI_OnlineResource></gmd:onLine></gmd:MD_DigitalTransferOptions></gmd:transferOptions></gmd:MD_Distribution></gmd:distributionInfo>
<gmd:dataQualityInfo><gmd:DQ_DataQuality><gmd:lineage><gmd:LI_Lineage><gmd:statement><gco:CharacterString>Supervised classification</gco:CharacterString></gmd:statement></gmd:LI_Lineage></gmd:lineage></gmd:DQ_DataQuality></gmd:dataQualityInfo>
</gmd:MD_Metadata>"#;
        let meta = parse_document(xml, "landcover.xml").unwrap();
        assert_eq!(meta.standard, MetadataStandard::Iso19115);
        assert_eq!(meta.title.as_deref(), Some("Land Cover 2020"));
        assert_eq!(meta.abstract_text.as_deref(), Some("Classified imagery."));
        assert_eq!(meta.keywords, vec!["land cover"]);
        assert_eq!(meta.topic_categories, vec!["environment"]);
        assert_eq!(meta.lineage.as_deref(), Some("Supervised classification"));
        assert_eq!(meta.links, vec!["https://agency.example/landcover"]);
        assert_eq!(
            meta.contact.as_deref(),
            Some("Mapping Agency | Email: info@agency.example")
        );
    }

    #[test]
    fn test_iso_19115_3_detected_by_prefix() {
        let xml = r#"<mdb:MD_Metadata xmlns:mdb="http://standards.iso.org/iso/19115/-3/mdb/2.0"></mdb:MD_Metadata>"#;
        let meta = parse_document(xml, "x.xml").unwrap();
        assert_eq!(meta.standard, MetadataStandard::Iso19115_3);
    }

    #[test]
    fn test_qgis_document() {
        let xml = r#"<!DOCTYPE qgis PUBLIC 'http://mrcc.com/qgis.dtd' 'SYSTEM'>
<qgis version="3.34.0">
  <identifier>rivers</identifier>
  <title>Rivers</title>
  <abstract>Major rivers</abstract>
  <keywords vocabulary="gmd:topicCategory"><keyword>inlandWaters</keyword></keywords>
  <keywords vocabulary="theme"><keyword>hydrography</keyword></keywords>
  <contact><name>Hydro Team</name><organization>Water Board</organization><email>hydro@example.org</email></contact>
  <links><link name="home" type="WWW:LINK" url="https://water.example/rivers"/></links>
  <rights>CC-BY</rights>
  <history>Imported 2023</history>
</qgis>"#;
        let meta = parse_document(xml, "rivers.qmd").unwrap();
        assert_eq!(meta.standard, MetadataStandard::Qgis);
        assert_eq!(meta.title.as_deref(), Some("Rivers"));
        assert_eq!(meta.keywords, vec!["hydrography"]);
        assert_eq!(meta.topic_categories, vec!["inlandWaters"]);
        assert_eq!(meta.constraints.as_deref(), Some("CC-BY"));
        assert_eq!(meta.lineage.as_deref(), Some("Imported 2023"));
        assert_eq!(meta.links, vec!["https://water.example/rivers"]);
        assert_eq!(
            meta.contact.as_deref(),
            Some("Hydro Team | Water Board | Email: hydro@example.org")
        );
    }

    #[test]
    fn test_unknown_dialect_still_yields_title() {
        let meta = parse_document("<doc><title>Plain</title></doc>", "plain.xml").unwrap();
        assert_eq!(meta.standard, MetadataStandard::Unknown);
        assert_eq!(meta.title.as_deref(), Some("Plain"));
    }

    #[test]
    fn test_malformed_document_is_error() {
        assert!(parse_document("<metadata><idinfo></metadata>", "bad.xml").is_err());
        assert!(parse_document("", "empty.xml").is_err());
    }

    #[test]
    fn test_non_http_links_are_dropped() {
        let xml = r#"<metadata><idinfo><citation><citeinfo><onlink>file:///tmp/x</onlink><onlink>ftp://data.example/x</onlink></citeinfo></citation></idinfo></metadata>"#;
        let meta = parse_document(xml, "x.xml").unwrap();
        assert_eq!(meta.links, vec!["ftp://data.example/x"]);
    }
}
